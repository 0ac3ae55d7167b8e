//! Rule catalog: threshold bands and validated escalation rules
//!
//! The catalog is built once per evaluation pass and is read-only afterwards.
//! Escalation rules are validated when first loaded for a subject; a malformed
//! rule is logged and excluded from that subject's escalation evaluation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::actions::Action;
use crate::config::{BandConfig, ThresholdsConfig};
use crate::error::{Error, Result};
use crate::store::RuleRepository;
use crate::types::{CheckType, EscalationLevelConfig, EscalationRule, Severity};

// ============================================
// Thresholds
// ============================================

/// A half-open percentage band `[low, high)`, or `[low, ∞)` when terminal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdBand {
    pub low: f64,
    /// Exclusive upper bound; `None` for the terminal band
    pub high: Option<f64>,
    pub severity: Severity,
}

impl ThresholdBand {
    pub fn contains(&self, value: f64) -> bool {
        value >= self.low && self.high.map_or(true, |high| value < high)
    }

    pub fn is_terminal(&self) -> bool {
        self.high.is_none()
    }
}

/// Fires when exactly `days` whole days remain before a deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadlineWindow {
    pub days: i64,
    pub severity: Severity,
}

/// Lookahead for milestones that are not yet due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpcomingWindow {
    /// Milestones due within this many days are reported
    pub warning_days: i64,
    /// At or below this many days remaining the finding is urgent
    pub urgent_days: i64,
}

/// Validated thresholds for every numeric check.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdSet {
    progress: Vec<ThresholdBand>,
    budget: Vec<ThresholdBand>,
    deadline_windows: Vec<DeadlineWindow>,
    upcoming: UpcomingWindow,
}

impl ThresholdSet {
    pub fn from_config(config: &ThresholdsConfig) -> Result<Self> {
        if !(config.band_width > 0.0) {
            return Err(Error::Config(
                "thresholds.band_width must be positive".to_string(),
            ));
        }

        let progress = build_bands("progress", &config.progress, config.band_width)?;
        let budget = build_bands("budget", &config.budget, config.band_width)?;

        if config.deadline_windows.is_empty() {
            return Err(Error::Config(
                "thresholds.deadline_windows is empty".to_string(),
            ));
        }
        let mut deadline_windows = Vec::with_capacity(config.deadline_windows.len());
        for window in &config.deadline_windows {
            if window.days <= 0 {
                return Err(Error::Config(format!(
                    "thresholds.deadline_windows: days must be positive, got {}",
                    window.days
                )));
            }
            if deadline_windows
                .iter()
                .any(|w: &DeadlineWindow| w.days == window.days)
            {
                return Err(Error::Config(format!(
                    "thresholds.deadline_windows: duplicate window {}",
                    window.days
                )));
            }
            deadline_windows.push(DeadlineWindow {
                days: window.days,
                severity: window.severity,
            });
        }

        if config.milestone_warning_days <= 0 {
            return Err(Error::Config(format!(
                "thresholds.milestone_warning_days must be positive, got {}",
                config.milestone_warning_days
            )));
        }
        if config.milestone_urgent_days < 0
            || config.milestone_urgent_days > config.milestone_warning_days
        {
            return Err(Error::Config(format!(
                "thresholds.milestone_urgent_days must be between 0 and {}, got {}",
                config.milestone_warning_days, config.milestone_urgent_days
            )));
        }

        Ok(Self {
            progress,
            budget,
            deadline_windows,
            upcoming: UpcomingWindow {
                warning_days: config.milestone_warning_days,
                urgent_days: config.milestone_urgent_days,
            },
        })
    }

    /// Ordered bands for a percentage check. Empty for non-percentage checks.
    pub fn bands(&self, check_type: CheckType) -> &[ThresholdBand] {
        match check_type {
            CheckType::Progress => &self.progress,
            CheckType::Budget => &self.budget,
            _ => &[],
        }
    }

    /// Exact days-remaining windows shared by schedule and contract deadlines.
    pub fn deadline_windows(&self) -> &[DeadlineWindow] {
        &self.deadline_windows
    }

    pub fn upcoming_window(&self) -> UpcomingWindow {
        self.upcoming
    }
}

impl Default for ThresholdSet {
    fn default() -> Self {
        // The default configuration always validates.
        Self::from_config(&ThresholdsConfig::default()).unwrap_or_else(|_| Self {
            progress: Vec::new(),
            budget: Vec::new(),
            deadline_windows: Vec::new(),
            upcoming: UpcomingWindow {
                warning_days: 7,
                urgent_days: 3,
            },
        })
    }
}

/// Non-terminal bands span `band_width`; the last band is open-ended.
fn build_bands(name: &str, configs: &[BandConfig], band_width: f64) -> Result<Vec<ThresholdBand>> {
    if configs.is_empty() {
        return Err(Error::Config(format!("thresholds.{} is empty", name)));
    }

    let mut bands = Vec::with_capacity(configs.len());
    for (i, band) in configs.iter().enumerate() {
        if !band.at.is_finite() || band.at < 0.0 {
            return Err(Error::Config(format!(
                "thresholds.{}: invalid band start {}",
                name, band.at
            )));
        }
        let high = if i + 1 == configs.len() {
            None
        } else {
            let high = band.at + band_width;
            if high > configs[i + 1].at {
                return Err(Error::Config(format!(
                    "thresholds.{}: band at {} overlaps band at {}",
                    name,
                    band.at,
                    configs[i + 1].at
                )));
            }
            Some(high)
        };
        bands.push(ThresholdBand {
            low: band.at,
            high,
            severity: band.severity,
        });
    }
    Ok(bands)
}

// ============================================
// Escalation rules
// ============================================

/// An escalation rule that passed validation, with its actions resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRule {
    pub rule: EscalationRule,
    pub actions: Vec<Action>,
}

impl ResolvedRule {
    pub fn id(&self) -> &str {
        &self.rule.id
    }

    pub fn levels(&self) -> &[EscalationLevelConfig] {
        &self.rule.escalation_levels
    }
}

/// Validate a rule and resolve its actions.
pub fn validate_rule(rule: &EscalationRule) -> Result<ResolvedRule> {
    if rule.escalation_levels.is_empty() {
        return Err(Error::rule(&rule.id, "escalation_levels is empty"));
    }
    if let Some(level) = rule
        .escalation_levels
        .iter()
        .find(|level| level.days_overdue <= 0)
    {
        return Err(Error::rule(
            &rule.id,
            format!(
                "level {} has non-positive days_overdue {}",
                level.level.as_str(),
                level.days_overdue
            ),
        ));
    }

    let actions = rule
        .actions
        .iter()
        .map(Action::resolve)
        .collect::<Result<Vec<_>>>()
        .map_err(|e| Error::rule(&rule.id, e.to_string()))?;

    Ok(ResolvedRule {
        rule: rule.clone(),
        actions,
    })
}

/// Per-pass view of thresholds and escalation rules.
pub struct RuleCatalog<'a> {
    repo: &'a dyn RuleRepository,
    thresholds: ThresholdSet,
    cache: Mutex<HashMap<String, Arc<Vec<ResolvedRule>>>>,
    rejected: AtomicUsize,
}

impl<'a> RuleCatalog<'a> {
    pub fn new(repo: &'a dyn RuleRepository, thresholds: ThresholdSet) -> Self {
        Self {
            repo,
            thresholds,
            cache: Mutex::new(HashMap::new()),
            rejected: AtomicUsize::new(0),
        }
    }

    /// Check a threshold configuration without building a catalog.
    pub fn validate_thresholds(config: &ThresholdsConfig) -> Result<()> {
        ThresholdSet::from_config(config).map(|_| ())
    }

    pub fn thresholds(&self) -> &ThresholdSet {
        &self.thresholds
    }

    /// Ordered threshold bands for a check type.
    pub fn resolve_thresholds(&self, check_type: CheckType) -> &[ThresholdBand] {
        self.thresholds.bands(check_type)
    }

    /// Active, valid escalation rules for a subject.
    ///
    /// Loaded from the repository once per catalog. Invalid rules are logged,
    /// counted and left out.
    pub fn resolve_escalation_levels(&self, subject_id: &str) -> Result<Arc<Vec<ResolvedRule>>> {
        if let Some(rules) = self
            .cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(subject_id)
        {
            return Ok(rules.clone());
        }

        let mut resolved = Vec::new();
        for rule in self.repo.rules_for(subject_id)? {
            if !rule.is_active {
                continue;
            }
            match validate_rule(&rule) {
                Ok(valid) => resolved.push(valid),
                Err(e) => {
                    self.rejected.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        rule_id = %rule.id,
                        subject_id,
                        error = %e,
                        "Escalation rule rejected"
                    );
                }
            }
        }

        let resolved = Arc::new(resolved);
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(subject_id.to_string(), resolved.clone());
        Ok(resolved)
    }

    /// Number of rules rejected by validation so far.
    pub fn rejected_count(&self) -> usize {
        self.rejected.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::ActionConfig;
    use crate::config::WindowConfig;
    use crate::types::EscalationLevel;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    struct FixedRules {
        rules: Vec<EscalationRule>,
        calls: AtomicUsize,
    }

    impl RuleRepository for FixedRules {
        fn rules_for(&self, subject_id: &str) -> Result<Vec<EscalationRule>> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Ok(self
                .rules
                .iter()
                .filter(|r| r.project_id == subject_id)
                .cloned()
                .collect())
        }
    }

    fn level(level: EscalationLevel, days: i64) -> EscalationLevelConfig {
        EscalationLevelConfig {
            level,
            days_overdue: days,
            notify_roles: vec![],
            message: None,
        }
    }

    fn rule(id: &str, levels: Vec<EscalationLevelConfig>) -> EscalationRule {
        EscalationRule {
            id: id.to_string(),
            project_id: "p-1".to_string(),
            name: id.to_string(),
            description: None,
            is_active: true,
            escalation_levels: levels,
            actions: vec![],
        }
    }

    #[test]
    fn test_default_bands_are_disjoint() {
        let set = ThresholdSet::default();
        let progress = set.bands(CheckType::Progress);
        assert_eq!(progress.len(), 3);
        assert_eq!(progress[0].high, Some(80.0));
        assert_eq!(progress[1].high, Some(95.0));
        assert!(progress[2].is_terminal());

        for value in [75.0, 79.0, 80.0, 90.0, 94.0, 95.0, 100.0, 250.0] {
            let matching = progress.iter().filter(|b| b.contains(value)).count();
            assert!(matching <= 1, "value {} matched {} bands", value, matching);
        }
        assert!(set.bands(CheckType::Deadline).is_empty());
        assert_eq!(set.deadline_windows().len(), 3);
    }

    #[test]
    fn test_overlapping_bands_rejected() {
        let config = ThresholdsConfig {
            progress: vec![
                BandConfig {
                    at: 75.0,
                    severity: Severity::Medium,
                },
                BandConfig {
                    at: 78.0,
                    severity: Severity::High,
                },
            ],
            ..Default::default()
        };
        assert!(ThresholdSet::from_config(&config).is_err());
    }

    #[test]
    fn test_non_positive_window_rejected() {
        let config = ThresholdsConfig {
            deadline_windows: vec![WindowConfig {
                days: 0,
                severity: Severity::High,
            }],
            ..Default::default()
        };
        assert!(RuleCatalog::validate_thresholds(&config).is_err());
    }

    #[test]
    fn test_upcoming_window_validation() {
        let defaults = ThresholdSet::default().upcoming_window();
        assert_eq!(defaults.warning_days, 7);
        assert_eq!(defaults.urgent_days, 3);

        let config = ThresholdsConfig {
            milestone_warning_days: 0,
            ..Default::default()
        };
        assert!(RuleCatalog::validate_thresholds(&config).is_err());

        let config = ThresholdsConfig {
            milestone_warning_days: 5,
            milestone_urgent_days: 6,
            ..Default::default()
        };
        assert!(RuleCatalog::validate_thresholds(&config).is_err());
    }

    #[test]
    fn test_validate_rule() {
        assert!(validate_rule(&rule("ok", vec![level(EscalationLevel::Manager, 3)])).is_ok());
        assert!(validate_rule(&rule("empty", vec![])).is_err());
        assert!(validate_rule(&rule("zero", vec![level(EscalationLevel::Manager, 0)])).is_err());

        let mut bad_action = rule("bad-action", vec![level(EscalationLevel::Manager, 3)]);
        bad_action.actions = vec![ActionConfig::new(
            "schedule_review_meeting",
            json!({"duration_minutes": -5}),
        )];
        let err = validate_rule(&bad_action).unwrap_err();
        assert!(matches!(err, Error::Rule { .. }));
    }

    #[test]
    fn test_catalog_excludes_invalid_and_inactive_rules() {
        let mut inactive = rule("inactive", vec![level(EscalationLevel::Manager, 1)]);
        inactive.is_active = false;
        let repo = FixedRules {
            rules: vec![
                rule("good", vec![level(EscalationLevel::Director, 7)]),
                rule("empty", vec![]),
                inactive,
            ],
            calls: AtomicUsize::new(0),
        };
        let catalog = RuleCatalog::new(&repo, ThresholdSet::default());

        let rules = catalog.resolve_escalation_levels("p-1").unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].id(), "good");
        assert_eq!(catalog.rejected_count(), 1);

        // Cached for the life of the catalog
        catalog.resolve_escalation_levels("p-1").unwrap();
        assert_eq!(repo.calls.load(Ordering::Relaxed), 1);
        assert_eq!(catalog.rejected_count(), 1);
    }
}
