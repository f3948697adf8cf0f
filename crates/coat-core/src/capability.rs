// NumericCapabilities — which narrow formats the runtime can store
//
// The FP8 codec in this crate is pure software, so the narrow path is
// available everywhere unless a host turns it off: either explicitly
// (`NumericCapabilities::bf16_only()`) or through the environment variable
// `COAT_DISABLE_FP8=1`. When it is off, every quantize call stores bfloat16
// codes instead. That is never an error; the only observable differences
// are this flag and a smaller memory saving.
//
// The value is resolved once (typically at startup) and passed into the
// quantizers, so hot loops never re-query the environment.

use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

/// Environment variable that forces the bfloat16 fallback when set to
/// `1`, `true`, `yes` or `on`.
pub const DISABLE_FP8_ENV: &str = "COAT_DISABLE_FP8";

static FALLBACK_NOTICE_EMITTED: AtomicBool = AtomicBool::new(false);

/// Narrow-format capabilities of the numeric runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumericCapabilities {
    fp8: bool,
}

impl Default for NumericCapabilities {
    fn default() -> Self {
        Self::detect()
    }
}

impl NumericCapabilities {
    /// Resolve capabilities from the environment.
    pub fn detect() -> Self {
        let disabled = std::env::var(DISABLE_FP8_ENV)
            .map(|v| parse_flag(&v))
            .unwrap_or(false);
        let caps = Self { fp8: !disabled };
        if disabled {
            caps.notify_fallback();
        } else {
            tracing::debug!("FP8 E4M3/E5M2 storage available");
        }
        caps
    }

    /// Capabilities with the FP8 path enabled.
    pub fn fp8() -> Self {
        Self { fp8: true }
    }

    /// Capabilities with no narrow format: quantized storage uses bfloat16.
    pub fn bf16_only() -> Self {
        let caps = Self { fp8: false };
        caps.notify_fallback();
        caps
    }

    /// Whether 8-bit float storage is available.
    pub fn has_fp8(&self) -> bool {
        self.fp8
    }

    /// Log the fallback once per process at `warn`, afterwards at `debug`.
    fn notify_fallback(&self) {
        if !FALLBACK_NOTICE_EMITTED.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                "FP8 storage unavailable; quantized state falls back to bfloat16 \
                 (reduced memory savings)"
            );
        } else {
            tracing::debug!("FP8 storage unavailable, using bfloat16 fallback");
        }
    }
}

fn parse_flag(v: &str) -> bool {
    matches!(
        v.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
