use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Custom epoch: 2025-01-01T00:00:00Z in milliseconds since Unix epoch.
const CHAT_EPOCH_MS: u64 = 1_735_689_600_000;

const WORKER_BITS: u64 = 10;
const SEQUENCE_BITS: u64 = 12;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;

struct State {
    last_ms: u64,
    sequence: u64,
}

/// 64-bit, time-ordered message id generator.
///
/// Layout (MSB → LSB):
/// - Bits 63–22: Timestamp (42 bits), ms since the chat epoch
/// - Bits 21–12: Worker ID (10 bits), one per gateway process
/// - Bits 11–0:  Sequence (12 bits), per-ms counter
///
/// Ids from one generator are strictly increasing, which is what makes
/// `before_id` cursors stable while new messages keep arriving.
pub struct SnowflakeGenerator {
    worker_id: u64,
    state: Mutex<State>,
}

impl SnowflakeGenerator {
    /// Worker ids are masked to 10 bits.
    pub fn new(worker_id: u16) -> Self {
        Self {
            worker_id: u64::from(worker_id) & ((1 << WORKER_BITS) - 1),
            state: Mutex::new(State {
                last_ms: 0,
                sequence: 0,
            }),
        }
    }

    pub fn generate(&self) -> i64 {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        // A clock that steps backwards keeps issuing ids from the last
        // observed millisecond so ordering never regresses.
        let mut now_ms = current_ms().max(state.last_ms);

        if now_ms == state.last_ms {
            state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
            if state.sequence == 0 {
                // Sequence exhausted for this millisecond.
                while now_ms <= state.last_ms {
                    std::hint::spin_loop();
                    now_ms = current_ms();
                }
            }
        } else {
            state.sequence = 0;
        }

        state.last_ms = now_ms;

        let ts = now_ms.saturating_sub(CHAT_EPOCH_MS);
        let id = (ts << (WORKER_BITS + SEQUENCE_BITS))
            | (self.worker_id << SEQUENCE_BITS)
            | state.sequence;

        id as i64
    }
}

fn current_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(CHAT_EPOCH_MS)
}
