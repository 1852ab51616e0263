//! Alert evaluator: per-probe, per-rule state machines.
//!
//! Two rule shapes exist. An instantaneous range rule opens as soon as a
//! value leaves its bounds and clears when one returns. A sustained range
//! rule tracks `breach_since` and only opens once the breach has held for
//! the sustain duration; a single in-bound reading resets it. Rules never
//! look at each other's state.
//!
//! [`apply_rules`] is pure; [`evaluate`] wraps it with the registry and
//! snapshot I/O.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use crate::models::{
    AlertEvent, AlertSnapshot, Limits, ProbeThresholds, RuleId, RuleState, Transition,
    ValidatedReading,
};
use crate::store::{AlertStore, ThresholdRegistry};

// ---

/// Reading field a rule watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    Lux,
    Rh,
    TempC,
    MoisturePct,
}

impl Metric {
    // ---
    pub fn value(self, reading: &ValidatedReading) -> Option<f64> {
        match self {
            Metric::Lux => reading.lux,
            Metric::Rh => reading.rh,
            Metric::TempC => reading.temp_c,
            Metric::MoisturePct => reading.moisture_pct,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Rule {
    InstantaneousRange {
        id: RuleId,
        metric: Metric,
        limits: Limits,
    },
    SustainedRange {
        id: RuleId,
        metric: Metric,
        limits: Limits,
        sustain: Duration,
    },
}

impl Rule {
    // ---
    pub fn id(&self) -> RuleId {
        match self {
            Rule::InstantaneousRange { id, .. } | Rule::SustainedRange { id, .. } => *id,
        }
    }

    pub fn metric(&self) -> Metric {
        match self {
            Rule::InstantaneousRange { metric, .. } | Rule::SustainedRange { metric, .. } => {
                *metric
            }
        }
    }

    /// Advance `state` with one non-null value observed at `ts`.
    fn step(&self, state: &mut RuleState, value: f64, ts: DateTime<Utc>) -> Option<Transition> {
        // ---
        state.last_value = Some(value);

        let transition = match self {
            Rule::InstantaneousRange { limits, .. } => {
                let breach = !limits.contains(value);
                match (state.open, breach) {
                    (false, true) => Some(Transition::Open),
                    (true, false) => Some(Transition::Clear),
                    _ => None,
                }
            }
            Rule::SustainedRange { limits, sustain, .. } => {
                if limits.contains(value) {
                    state.breach_since = None;
                    state.open.then_some(Transition::Clear)
                } else {
                    let since = *state.breach_since.get_or_insert(ts);
                    (!state.open && ts - since >= *sustain).then_some(Transition::Open)
                }
            }
        }?;

        state.open = transition == Transition::Open;
        state.changed_at = Some(ts);
        Some(transition)
    }
}

/// Build the rule set for one probe from its thresholds.
pub fn rules_for(thresholds: &ProbeThresholds) -> Vec<Rule> {
    // ---
    let mut rules = Vec::new();

    for (id, metric, limits) in [
        (RuleId::LuxOutOfRange, Metric::Lux, thresholds.lux),
        (RuleId::RhOutOfRange, Metric::Rh, thresholds.rh),
        (RuleId::TempOutOfRange, Metric::TempC, thresholds.temp_c),
    ] {
        if !limits.is_empty() {
            rules.push(Rule::InstantaneousRange { id, metric, limits });
        }
    }

    let sustain = Duration::minutes(thresholds.sustain_minutes.max(0));
    let moisture = thresholds.moisture_pct;

    if moisture.min.is_some() {
        let limits = Limits::new(moisture.min, None);
        rules.push(Rule::InstantaneousRange {
            id: RuleId::TooDry,
            metric: Metric::MoisturePct,
            limits,
        });
        rules.push(Rule::SustainedRange {
            id: RuleId::MoistureLowSustain,
            metric: Metric::MoisturePct,
            limits,
            sustain,
        });
    }

    if moisture.max.is_some() {
        let limits = Limits::new(None, moisture.max);
        rules.push(Rule::InstantaneousRange {
            id: RuleId::TooWet,
            metric: Metric::MoisturePct,
            limits,
        });
        rules.push(Rule::SustainedRange {
            id: RuleId::MoistureHighSustain,
            metric: Metric::MoisturePct,
            limits,
            sustain,
        });
    }

    rules
}

/// Run every rule against one reading.
///
/// `reading_id` is the log id the reading was committed under. Returns the
/// next snapshot and the transitions it produced. A rule whose metric is null
/// on this reading keeps its prior state untouched.
pub fn apply_rules(
    rules: &[Rule],
    prior: &AlertSnapshot,
    reading: &ValidatedReading,
    reading_id: i64,
    now: DateTime<Utc>,
) -> (AlertSnapshot, Vec<AlertEvent>) {
    // ---
    let mut next = prior.clone();
    let mut events = Vec::new();

    for rule in rules {
        let Some(value) = rule.metric().value(reading) else {
            continue;
        };
        let state = next.rules.entry(rule.id()).or_default();
        if let Some(transition) = rule.step(state, value, reading.ts) {
            events.push(AlertEvent {
                event_id: AlertEvent::event_id_for(reading.probe_id, reading_id, rule.id(), transition),
                probe_id: reading.probe_id,
                rule: rule.id(),
                transition,
                value: Some(value),
                ts: reading.ts,
                recorded_at: now,
            });
        }
    }

    if !events.is_empty() {
        next.updated_at = now;
    }
    (next, events)
}

/// Evaluate a freshly committed reading and persist any state change.
///
/// Load and save are not atomic against each other; callers serialize
/// evaluations per probe.
pub async fn evaluate<S>(
    store: &S,
    reading: &ValidatedReading,
    reading_id: i64,
    now: DateTime<Utc>,
) -> Result<Vec<AlertEvent>>
where
    S: ThresholdRegistry + AlertStore + ?Sized,
{
    // ---
    let probe_id = reading.probe_id;
    let Some(thresholds) = store
        .thresholds(probe_id)
        .await
        .with_context(|| format!("load thresholds for probe {probe_id}"))?
    else {
        debug!(probe_id, "no thresholds configured, skipping alerts");
        return Ok(Vec::new());
    };

    let rules = rules_for(&thresholds);
    let prior = store
        .load_snapshot(probe_id)
        .await?
        .unwrap_or_else(|| AlertSnapshot::empty(probe_id, now));

    let (next, events) = apply_rules(&rules, &prior, reading, reading_id, now);
    if next != prior {
        store.save_snapshot(&next, &events).await?;
    }

    for event in &events {
        info!(
            probe_id,
            rule = %event.rule,
            transition = event.transition.as_str(),
            value = ?event.value,
            ts = %event.ts,
            "alert transition"
        );
    }
    Ok(events)
}
