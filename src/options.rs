//! Engine configuration and option handling by name.

use crate::eval::EvalConfig;

pub const DEFAULT_CACHE_SIZE: usize = 1 << 18;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

/// Side effect an option change needs from the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OptionAction {
    SetThreads(usize),
    ResizeCache(usize),
}

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EngineOptions {
    pub threads: usize,
    /// Requested cache slots (rounded up to a power of two).
    pub cache_size: usize,
    pub poll_interval_ms: u64,
    pub eval: EvalConfig,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            threads: 1,
            cache_size: DEFAULT_CACHE_SIZE,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            eval: EvalConfig::default(),
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "on" | "yes" => Some(true),
        "false" | "0" | "off" | "no" => Some(false),
        _ => None,
    }
}

impl EngineOptions {
    /// Set an option by name. Unknown names and unparsable values are ignored.
    /// Returns the action the engine must take, if any.
    pub fn apply(&mut self, name: &str, value: Option<&str>) -> Option<OptionAction> {
        let normalized = name.trim().to_ascii_lowercase();
        let value = value.map(str::trim);
        match normalized.as_str() {
            "threads" => {
                let threads = value.and_then(|v| v.parse::<usize>().ok())?.max(1);
                if threads != self.threads {
                    self.threads = threads;
                    return Some(OptionAction::SetThreads(threads));
                }
            }
            "cache" | "cache size" | "cachesize" => {
                let slots = value
                    .and_then(|v| v.parse::<usize>().ok())
                    .unwrap_or(DEFAULT_CACHE_SIZE)
                    .max(1);
                if slots != self.cache_size {
                    self.cache_size = slots;
                    return Some(OptionAction::ResizeCache(slots));
                }
            }
            "poll interval" | "pollinterval" => {
                if let Some(ms) = value.and_then(|v| v.parse::<u64>().ok()) {
                    self.poll_interval_ms = ms.max(1);
                }
            }
            "plies" => {
                if let Some(plies) = value.and_then(|v| v.parse::<u8>().ok()) {
                    self.eval.plies = plies.min(crate::cache::EvalContext::MAX_PLIES);
                }
            }
            "noise" => {
                if let Some(noise) = value.and_then(|v| v.parse::<f32>().ok()) {
                    if noise.is_finite() {
                        self.eval.noise = noise.max(0.0);
                    }
                }
            }
            "deterministic" => {
                if let Some(v) = value.and_then(parse_bool) {
                    self.eval.deterministic = v;
                }
            }
            "cubeful" => {
                if let Some(v) = value.and_then(parse_bool) {
                    self.eval.cubeful = v;
                }
            }
            "prune" | "use prune" => {
                if let Some(v) = value.and_then(parse_bool) {
                    self.eval.use_prune = v;
                }
            }
            _ => log::debug!("ignoring unknown option '{name}'"),
        }
        None
    }

    #[must_use]
    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threads_action() {
        let mut opts = EngineOptions::default();
        assert_eq!(opts.apply("Threads", Some("4")), Some(OptionAction::SetThreads(4)));
        assert_eq!(opts.threads, 4);
        assert_eq!(opts.apply("threads", Some("4")), None);
        assert_eq!(opts.apply("threads", Some("0")), Some(OptionAction::SetThreads(1)));
        assert_eq!(opts.apply("threads", Some("many")), None);
        assert_eq!(opts.threads, 1);
    }

    #[test]
    fn test_cache_action() {
        let mut opts = EngineOptions::default();
        assert_eq!(
            opts.apply(" Cache Size ", Some("1024")),
            Some(OptionAction::ResizeCache(1024))
        );
        assert_eq!(opts.cache_size, 1024);
    }

    #[test]
    fn test_eval_options() {
        let mut opts = EngineOptions::default();
        assert_eq!(opts.apply("plies", Some("2")), None);
        assert_eq!(opts.apply("noise", Some("0.05")), None);
        assert_eq!(opts.apply("deterministic", Some("off")), None);
        assert_eq!(opts.apply("prune", Some("true")), None);
        assert_eq!(opts.apply("cubeful", Some("maybe")), None);

        assert_eq!(opts.eval.plies, 2);
        assert!((opts.eval.noise - 0.05).abs() < 1e-6);
        assert!(!opts.eval.deterministic);
        assert!(opts.eval.use_prune);
        assert!(!opts.eval.cubeful);
    }

    #[test]
    fn test_noise_never_negative() {
        let mut opts = EngineOptions::default();
        opts.apply("noise", Some("-1"));
        assert_eq!(opts.eval.noise, 0.0);
        opts.apply("noise", Some("NaN"));
        assert_eq!(opts.eval.noise, 0.0);
    }

    #[test]
    fn test_unknown_option_ignored() {
        let mut opts = EngineOptions::default();
        assert_eq!(opts.apply("hash", Some("64")), None);
        assert_eq!(opts, EngineOptions::default());
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_options_serde() {
        let mut opts = EngineOptions::default();
        opts.apply("threads", Some("3"));
        let json = serde_json::to_string(&opts).unwrap();
        let back: EngineOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(back, opts);
    }
}
