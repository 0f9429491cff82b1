//! Handshake configuration

use crate::barrier::BarrierMode;
use crate::error::ConfigError;

/// Environment variable holding a bulk option string (`name=value name=value`)
pub const OPTIONS_ENV: &str = "OTTER_GC_OPTIONS";

/// Smallest granule: one heap word
const MIN_LOG_GRANULE: u8 = 3;
/// Largest granule: 4KB
const MAX_LOG_GRANULE: u8 = 12;

/// Handshake configuration
///
/// Fixed for the life of the process once the [`Handshake`](crate::Handshake)
/// is built from it.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// Barrier call-site strategy (default: fast path inlined)
    pub barrier: BarrierMode,
    /// log2 of the granule size covered by one metadata bit (default: 3, 8 bytes)
    pub log_granule_bytes: u8,
    /// Start of the heap range covered by the side metadata
    pub heap_base: usize,
    /// Size of the heap range covered by the side metadata (default: 256MB)
    pub heap_size: usize,
    /// Capacity of the first roots buffer handed to a scanning thread (default: 4096)
    pub roots_buffer_capacity: usize,
    /// Whether the runtime reports mutators while parking them, or the
    /// coordinator walks the registry afterwards (default: true)
    pub scan_mutators_in_safepoint: bool,
    /// Number of collector worker threads (default: available parallelism)
    pub gc_threads: usize,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            barrier: BarrierMode::FastPath,
            log_granule_bytes: 3,
            heap_base: 0x0200_0000_0000,
            heap_size: 256 * 1024 * 1024,
            roots_buffer_capacity: 4096,
            scan_mutators_in_safepoint: true,
            gc_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        }
    }
}

impl HandshakeConfig {
    /// Granule size in bytes
    pub fn granule_bytes(&self) -> usize {
        1 << self.log_granule_bytes
    }

    /// Apply a single `name=value` option
    pub fn process(&mut self, name: &str, value: &str) -> Result<(), ConfigError> {
        let invalid = |reason| ConfigError::InvalidValue {
            name: name.to_string(),
            value: value.to_string(),
            reason,
        };

        match name {
            "barrier_fastpath" => {
                self.barrier = if parse_bool(value).ok_or_else(|| invalid("expected a boolean"))? {
                    BarrierMode::FastPath
                } else {
                    BarrierMode::AlwaysSlow
                };
            }
            "granule_bytes" => {
                let bytes = parse_usize(value).ok_or_else(|| invalid("expected a size"))?;
                if !bytes.is_power_of_two()
                    || bytes < 1 << MIN_LOG_GRANULE
                    || bytes > 1 << MAX_LOG_GRANULE
                {
                    return Err(invalid("must be a power of two between 8 and 4096"));
                }
                self.log_granule_bytes = bytes.trailing_zeros() as u8;
            }
            "heap_base" => {
                self.heap_base = parse_usize(value).ok_or_else(|| invalid("expected an address"))?;
            }
            "heap_size" => {
                let size = parse_usize(value).ok_or_else(|| invalid("expected a size"))?;
                if size == 0 {
                    return Err(invalid("must be non-zero"));
                }
                self.heap_size = size;
            }
            "roots_buffer_capacity" => {
                let cap = parse_usize(value).ok_or_else(|| invalid("expected a count"))?;
                if cap == 0 {
                    return Err(invalid("must be non-zero"));
                }
                self.roots_buffer_capacity = cap;
            }
            "scan_mutators_in_safepoint" => {
                self.scan_mutators_in_safepoint =
                    parse_bool(value).ok_or_else(|| invalid("expected a boolean"))?;
            }
            "gc_threads" => {
                let n = parse_usize(value).ok_or_else(|| invalid("expected a count"))?;
                if n == 0 {
                    return Err(invalid("must be non-zero"));
                }
                self.gc_threads = n;
            }
            _ => return Err(ConfigError::UnknownOption(name.to_string())),
        }
        Ok(())
    }

    /// Apply whitespace-separated `name=value` options
    pub fn process_bulk(&mut self, options: &str) -> Result<(), ConfigError> {
        for option in options.split_whitespace() {
            let (name, value) = option
                .split_once('=')
                .ok_or_else(|| ConfigError::Malformed(option.to_string()))?;
            self.process(name, value)?;
        }
        Ok(())
    }

    /// Defaults overridden by `OTTER_GC_OPTIONS`, if set
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Ok(options) = std::env::var(OPTIONS_ENV) {
            config.process_bulk(&options)?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Check constraints that span several options
    pub fn validate(&self) -> Result<(), ConfigError> {
        // The field is public, so `process` may have been bypassed
        if !(MIN_LOG_GRANULE..=MAX_LOG_GRANULE).contains(&self.log_granule_bytes) {
            return Err(ConfigError::InvalidValue {
                name: "log_granule_bytes".to_string(),
                value: self.log_granule_bytes.to_string(),
                reason: "granule must be between 8 and 4096 bytes",
            });
        }
        if self.heap_base & (self.granule_bytes() - 1) != 0 {
            return Err(ConfigError::InvalidValue {
                name: "heap_base".to_string(),
                value: format!("{:#x}", self.heap_base),
                reason: "must be aligned to the granule size",
            });
        }
        if self.heap_base.checked_add(self.heap_size).is_none() {
            return Err(ConfigError::InvalidValue {
                name: "heap_size".to_string(),
                value: self.heap_size.to_string(),
                reason: "heap range overflows the address space",
            });
        }
        Ok(())
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

/// Decimal or `0x` hex, with optional K/M/G suffix
fn parse_usize(value: &str) -> Option<usize> {
    if let Some(hex) = value.strip_prefix("0x") {
        return usize::from_str_radix(hex, 16).ok();
    }
    let (digits, scale) = match value.as_bytes().last()? {
        b'K' | b'k' => (&value[..value.len() - 1], 1 << 10),
        b'M' | b'm' => (&value[..value.len() - 1], 1 << 20),
        b'G' | b'g' => (&value[..value.len() - 1], 1 << 30),
        _ => (value, 1),
    };
    digits.parse::<usize>().ok()?.checked_mul(scale)
}
