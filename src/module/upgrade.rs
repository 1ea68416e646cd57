//! Versioned settings migration.
//!
//! Each module revision that changed the shape of the setting list registers
//! one pure migration step taking the values saved at revision `n` to the
//! values expected at revision `n + 1`. Loading an old record walks the chain
//! until it reaches the module's current revision.

use crate::pipeline::error::{PipelineError, PipelineResult};

/// A single migration step.
pub type MigrateFn = fn(Vec<String>) -> Vec<String>;

/// Result of `Module::upgrade_settings`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradedSettings {
    pub values: Vec<String>,
    pub revision: u32,
    /// Still set when the values are in the legacy format and no converter
    /// accepted them. Callers must reject such records.
    pub from_legacy: bool,
}

#[derive(Debug, Clone, Copy)]
struct Step {
    from_revision: u32,
    migrate: MigrateFn,
}

#[derive(Debug, Clone, Copy)]
struct LegacyStep {
    legacy_revision: u32,
    to_revision: u32,
    convert: MigrateFn,
}

/// Ordered list of migrations ending at a module's current revision.
#[derive(Debug, Clone)]
pub struct UpgradeChain {
    current: u32,
    steps: Vec<Step>,
    legacy: Vec<LegacyStep>,
}

impl UpgradeChain {
    /// A chain with no migrations: only `current` is accepted.
    pub fn new(current: u32) -> Self {
        Self {
            current,
            steps: Vec::new(),
            legacy: Vec::new(),
        }
    }

    /// Register the migration from `from_revision` to `from_revision + 1`.
    pub fn step(mut self, from_revision: u32, migrate: MigrateFn) -> Self {
        self.steps.push(Step {
            from_revision,
            migrate,
        });
        self
    }

    /// Register a converter from a legacy-format revision into the native
    /// revision `to_revision`.
    pub fn legacy(mut self, legacy_revision: u32, to_revision: u32, convert: MigrateFn) -> Self {
        self.legacy.push(LegacyStep {
            legacy_revision,
            to_revision,
            convert,
        });
        self
    }

    pub fn current(&self) -> u32 {
        self.current
    }

    /// Migrate `values` saved at `revision` up to the current revision.
    ///
    /// Applying this to its own output is a no-op.
    pub fn apply(
        &self,
        values: Vec<String>,
        revision: u32,
        module_name: &str,
        from_legacy: bool,
    ) -> PipelineResult<UpgradedSettings> {
        let mut values = values;
        let mut revision = revision;

        if from_legacy {
            match self.legacy.iter().find(|l| l.legacy_revision == revision) {
                Some(l) => {
                    values = (l.convert)(values);
                    revision = l.to_revision;
                }
                None => {
                    return Ok(UpgradedSettings {
                        values,
                        revision,
                        from_legacy: true,
                    })
                }
            }
        }

        if revision > self.current {
            return Err(PipelineError::Upgrade {
                module_name: module_name.to_string(),
                revision,
                message: format!(
                    "saved by a newer version (this version supports revision {})",
                    self.current
                ),
            });
        }

        while revision < self.current {
            let step = self
                .steps
                .iter()
                .find(|s| s.from_revision == revision)
                .ok_or_else(|| PipelineError::Upgrade {
                    module_name: module_name.to_string(),
                    revision,
                    message: "no migration is registered for this revision".into(),
                })?;
            values = (step.migrate)(values);
            revision += 1;
            tracing::debug!("Upgraded {} settings to revision {}", module_name, revision);
        }

        Ok(UpgradedSettings {
            values,
            revision,
            from_legacy: false,
        })
    }
}
