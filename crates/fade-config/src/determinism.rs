use rand::{rngs::StdRng, SeedableRng};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::OnceLock;

const DEFAULT_SEED: u64 = 42;

/// Process-wide seeding policy for components that were not handed an
/// explicit seed.
///
/// Read once from `FADE_DETERMINISTIC` and `FADE_DETERMINISTIC_SEED`.
#[derive(Clone, Debug)]
pub struct DeterminismConfig {
    pub enabled: bool,
    pub base_seed: u64,
}

impl Default for DeterminismConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_seed: DEFAULT_SEED,
        }
    }
}

impl DeterminismConfig {
    fn from_env() -> Self {
        let enabled = match std::env::var("FADE_DETERMINISTIC") {
            Ok(raw) => !matches!(raw.trim(), "" | "0" | "false" | "False" | "off" | "OFF"),
            Err(_) => false,
        };
        let base_seed = std::env::var("FADE_DETERMINISTIC_SEED")
            .ok()
            .and_then(|raw| raw.trim().parse::<u64>().ok())
            .unwrap_or(DEFAULT_SEED);
        Self { enabled, base_seed }
    }

    pub fn seed_for(&self, label: &str) -> u64 {
        derive_seed(self.base_seed, label)
    }
}

static CONFIG: OnceLock<DeterminismConfig> = OnceLock::new();

pub fn config() -> &'static DeterminismConfig {
    CONFIG.get_or_init(DeterminismConfig::from_env)
}

/// RNG for `label` under the process-wide policy; entropy-seeded unless
/// determinism is switched on.
pub fn rng_from_label(label: &str) -> StdRng {
    let cfg = config();
    if cfg.enabled {
        StdRng::seed_from_u64(cfg.seed_for(label))
    } else {
        StdRng::from_entropy()
    }
}

/// An explicit seed always wins over the process-wide policy.
pub fn rng_from_optional(seed: Option<u64>, label: &str) -> StdRng {
    seed.map_or_else(|| rng_from_label(label), StdRng::seed_from_u64)
}

/// Mixes a trial seed with a component label so that adapters, data order and
/// samplers inside one trial draw from independent but reproducible streams.
pub fn derive_seed(seed: u64, label: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    seed.hash(&mut hasher);
    label.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
    use std::sync::{Mutex, OnceLock};

    fn with_env(vars: &[(&str, Option<&str>)], test: impl FnOnce()) {
        static GUARD: OnceLock<Mutex<()>> = OnceLock::new();
        let _lock = GUARD.get_or_init(|| Mutex::new(())).lock().unwrap();

        let snapshot: Vec<(String, Option<String>)> = vars
            .iter()
            .map(|(key, value)| {
                let previous = std::env::var(key).ok();
                match value {
                    Some(val) => std::env::set_var(key, val),
                    None => std::env::remove_var(key),
                }
                ((*key).to_string(), previous)
            })
            .collect();

        let result = catch_unwind(AssertUnwindSafe(test));

        for (key, value) in snapshot {
            match value {
                Some(val) => std::env::set_var(&key, val),
                None => std::env::remove_var(&key),
            }
        }

        if let Err(err) = result {
            resume_unwind(err);
        }
    }

    #[test]
    fn defaults_disable_determinism() {
        with_env(
            &[
                ("FADE_DETERMINISTIC", None),
                ("FADE_DETERMINISTIC_SEED", None),
            ],
            || {
                let cfg = DeterminismConfig::from_env();
                assert!(!cfg.enabled);
                assert_eq!(cfg.base_seed, DEFAULT_SEED);
            },
        );
    }

    #[test]
    fn explicit_enables_override_defaults() {
        with_env(
            &[
                ("FADE_DETERMINISTIC", Some("1")),
                ("FADE_DETERMINISTIC_SEED", Some("1337")),
            ],
            || {
                let cfg = DeterminismConfig::from_env();
                assert!(cfg.enabled);
                assert_eq!(cfg.base_seed, 1337);
            },
        );
    }

    #[test]
    fn textual_false_values_disable_flags() {
        with_env(&[("FADE_DETERMINISTIC", Some("off"))], || {
            let cfg = DeterminismConfig::from_env();
            assert!(!cfg.enabled);
        });
    }

    #[test]
    fn derived_seeds_are_stable_per_label() {
        let cfg = DeterminismConfig {
            enabled: true,
            base_seed: 99,
        };
        assert_eq!(cfg.seed_for("alpha"), derive_seed(99, "alpha"));
        assert_ne!(cfg.seed_for("alpha"), cfg.seed_for("beta"));
        assert_eq!(derive_seed(7, "adv"), derive_seed(7, "adv"));
        assert_ne!(derive_seed(7, "adv"), derive_seed(7, "ret"));
    }

    #[test]
    fn explicit_seed_is_reproducible() {
        let a: f64 = rng_from_optional(Some(5), "x").gen();
        let b: f64 = rng_from_optional(Some(5), "y").gen();
        assert_eq!(a, b);
    }
}
