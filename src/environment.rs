//! # Effective environment construction.
//!
//! Each child sees an environment layered from, lowest precedence first:
//!
//! 1. the supervisor's own process environment
//! 2. `encab.environment`
//! 3. extension-provided variables (startup script, validation defaults)
//! 4. the program's own `environment`
//!
//! A `null` value at any layer removes the variable. The layering runs once,
//! after the `update_environment` hook, and the result is immutable for the
//! lifetime of the child.

use indexmap::IndexMap;

use crate::config::{Config, EnvOverlay};

/// Fully resolved environment (name → value).
pub type EnvMap = IndexMap<String, String>;

/// Applies an overlay onto a resolved environment; `None` removes.
pub fn apply_overlay(env: &mut EnvMap, overlay: &EnvOverlay) {
    for (name, value) in overlay {
        match value {
            Some(v) => {
                env.insert(name.clone(), v.clone());
            }
            None => {
                env.shift_remove(name);
            }
        }
    }
}

/// Mutable environment state threaded through the `update_environment` hook.
///
/// Extensions mutate the shared base (startup script) or individual program
/// overlays (validation defaults); the supervisor then freezes one effective
/// map per program.
#[derive(Debug, Clone)]
pub struct Environments {
    /// Variables shared by all programs.
    pub base: EnvMap,
    /// Per-program overlays, keyed by program name, in declared order.
    pub programs: IndexMap<String, EnvOverlay>,
}

impl Environments {
    /// Seeds the layers from the process environment and the config.
    pub fn from_config(config: &Config) -> Self {
        let mut base: EnvMap = std::env::vars().collect();
        apply_overlay(&mut base, &config.encab.environment);

        let programs = config
            .programs
            .iter()
            .map(|(name, program)| (name.clone(), program.environment.clone()))
            .collect();

        Self { base, programs }
    }

    /// The effective environment for one program.
    pub fn effective(&self, program: &str) -> EnvMap {
        let mut env = self.base.clone();
        if let Some(overlay) = self.programs.get(program) {
            apply_overlay(&mut env, overlay);
        }
        env
    }

    /// Sets a variable in one program's overlay (used for validation defaults).
    pub fn set_program_var(&mut self, program: &str, name: &str, value: &str) {
        if let Some(overlay) = self.programs.get_mut(program) {
            overlay.insert(name.to_string(), Some(value.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overlay(pairs: &[(&str, Option<&str>)]) -> EnvOverlay {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.map(String::from)))
            .collect()
    }

    #[test]
    fn overlay_sets_and_removes() {
        let mut env: EnvMap = [("KEEP".to_string(), "1".to_string())].into_iter().collect();
        apply_overlay(
            &mut env,
            &overlay(&[("NEW", Some("2")), ("KEEP", None)]),
        );
        assert_eq!(env.get("NEW").map(String::as_str), Some("2"));
        assert!(!env.contains_key("KEEP"));
    }

    #[test]
    fn program_overlay_wins_over_base() {
        let mut envs = Environments {
            base: [("X".to_string(), "base".to_string())].into_iter().collect(),
            programs: IndexMap::new(),
        };
        envs.programs
            .insert("main".to_string(), overlay(&[("X", Some("program"))]));

        assert_eq!(
            envs.effective("main").get("X").map(String::as_str),
            Some("program")
        );
        assert_eq!(
            envs.effective("other").get("X").map(String::as_str),
            Some("base")
        );
    }

    #[test]
    fn validation_defaults_land_in_overlay() {
        let mut envs = Environments {
            base: EnvMap::new(),
            programs: [("main".to_string(), EnvOverlay::new())].into_iter().collect(),
        };
        envs.set_program_var("main", "PORT", "8080");
        assert_eq!(
            envs.effective("main").get("PORT").map(String::as_str),
            Some("8080")
        );
    }
}
