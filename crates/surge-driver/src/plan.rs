// Message scheduling: the ordered start-times each stream's producer walks,
// either the plain time grid or a seeded shuffle of it.
use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;

/// Plans the per-stream message order.
///
/// All streams draw from one shared RNG in declaration order, so a given
/// (PERM_SEED, stream count) pair always yields the same set of schedules.
pub struct Planner {
    perm_rng: Option<ChaCha8Rng>,
    first_time: i64,
    message_span: i64,
    num_messages: i64,
}

impl Planner {
    pub fn new(
        perm_seed: i64,
        first_time: i64,
        points_per_message: u32,
        nanos_between_points: i64,
        total_records: i64,
    ) -> Self {
        let perm_rng = (perm_seed != 0).then(|| ChaCha8Rng::seed_from_u64(perm_seed as u64));
        Self {
            perm_rng,
            first_time,
            message_span: i64::from(points_per_message).saturating_mul(nanos_between_points),
            num_messages: {
                let points_per_message = i64::from(points_per_message);
                (total_records + points_per_message - 1) / points_per_message
            },
        }
    }

    pub fn num_messages(&self) -> i64 {
        self.num_messages
    }

    /// Produce the next stream's schedule of message start-times.
    pub fn schedule(&mut self) -> Vec<i64> {
        let mut order: Vec<i64> = (0..self.num_messages).collect();
        if let Some(rng) = self.perm_rng.as_mut() {
            order.shuffle(rng);
        }
        order
            .into_iter()
            .map(|slot| self.first_time + self.message_span * slot)
            .collect()
    }
}

/// Point count for the message starting at `start`: a full message unless
/// the remaining time budget truncates it.
pub fn points_in_message(
    start: i64,
    end_time: i64,
    nanos_between_points: i64,
    points_per_message: u32,
) -> u32 {
    let span = i64::from(points_per_message).saturating_mul(nanos_between_points);
    let remaining = end_time.saturating_sub(start);
    if remaining < span {
        (remaining / nanos_between_points).max(0) as u32
    } else {
        points_per_message
    }
}
