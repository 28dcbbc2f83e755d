// Sample generation: deterministic sine-table values on the exact time grid,
// or normal-distributed values with bounded timestamp jitter.
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use std::sync::OnceLock;
use surge_wire::Record;

pub const SINE_TABLE_LEN: usize = 100;

/// Tabulated sin(2π·k/100), indexed modulo the table length.
pub fn sine_value(index: u64) -> f64 {
    static TABLE: OnceLock<[f64; SINE_TABLE_LEN]> = OnceLock::new();
    let table = TABLE.get_or_init(|| {
        std::array::from_fn(|k| {
            (2.0 * std::f64::consts::PI * k as f64 / SINE_TABLE_LEN as f64).sin()
        })
    });
    table[(index % SINE_TABLE_LEN as u64) as usize]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueMode {
    /// Sine-table values on the exact grid; trivially predictable by a
    /// verifier replaying the same per-stream sample index.
    Deterministic,
    /// Standard-normal values with timestamps jittered within [0, J).
    Stochastic,
}

/// Per-stream producer of `(time, value)` records.
///
/// The generator carries no state across messages beyond the caller's RNG
/// and, in deterministic mode, the stream's sample index. The verifier
/// constructs an identical generator (and an identically seeded RNG) and
/// replays it record for record, so the draw order here — jitter first,
/// then value — is part of the contract.
#[derive(Debug)]
pub struct SampleGen {
    mode: ValueMode,
    max_time_offset: i64,
    index: u64,
}

impl SampleGen {
    pub fn new(mode: ValueMode, max_time_offset: i64) -> Self {
        Self {
            mode,
            max_time_offset,
            index: 0,
        }
    }

    pub fn next_record(&mut self, grid_time: i64, rng: &mut ChaCha8Rng) -> Record {
        match self.mode {
            ValueMode::Deterministic => {
                let value = sine_value(self.index);
                self.index += 1;
                Record {
                    time: grid_time,
                    value,
                }
            }
            ValueMode::Stochastic => {
                // The jitter draw happens even when the offset is zero so a
                // replaying verifier consumes the RNG in the same order.
                let jitter = (rng.random::<f64>() * self.max_time_offset as f64) as i64;
                let value: f64 = rng.sample(StandardNormal);
                Record {
                    time: grid_time + jitter,
                    value,
                }
            }
        }
    }
}
