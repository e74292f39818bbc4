//! Combine functions
//!
//! Each configured metric folds matching events into an [`Accumulator`].
//! `count` and `sum` are not idempotent and rely on per-window event-id
//! deduplication; `min`, `max` and `distinct` give the same result when an
//! event is applied twice.

use serde::{Deserialize, Serialize};
use tracing::trace;

use rollup_common::config::{CombineKind, MetricSpec};
use rollup_common::error::{Error, Result};
use rollup_common::event::{Event, PropertyValue};

use crate::hll::DistinctSketch;

/// What one event contributes to one metric
#[derive(Debug, Clone, PartialEq)]
pub enum Contribution<'a> {
    /// The event itself counts
    Occurrence,
    /// Numeric property value
    Number(f64),
    /// Property value identifying a distinct item
    Token(&'a PropertyValue),
}

/// Extract an event's contribution to `spec`.
///
/// `None` when the event type does not match or the configured field is
/// missing or unusable for the combine function.
pub fn contribution<'a>(spec: &MetricSpec, event: &'a Event) -> Option<Contribution<'a>> {
    if let Some(event_type) = &spec.event_type {
        if event_type != &event.event_type {
            return None;
        }
    }

    let field = match (&spec.field, spec.function) {
        (None, CombineKind::Count) => return Some(Contribution::Occurrence),
        (None, _) => return None,
        (Some(field), _) => event.property(field),
    };

    let value = match field {
        Some(PropertyValue::Null) | None => return None,
        Some(value) => value,
    };

    match spec.function {
        CombineKind::Count => Some(Contribution::Occurrence),
        CombineKind::Sum | CombineKind::Min | CombineKind::Max => match value.as_f64() {
            Some(n) if n.is_finite() => Some(Contribution::Number(n)),
            _ => {
                trace!(
                    "Event {} has non-numeric {:?} for metric {}",
                    event.event_id,
                    spec.field,
                    spec.name
                );
                None
            }
        },
        CombineKind::Distinct => Some(Contribution::Token(value)),
    }
}

/// Running state of a combine function over one window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Accumulator {
    Count(u64),
    Sum(f64),
    Min(Option<f64>),
    Max(Option<f64>),
    Distinct(DistinctSketch),
}

impl Accumulator {
    pub fn new(kind: CombineKind) -> Self {
        match kind {
            CombineKind::Count => Accumulator::Count(0),
            CombineKind::Sum => Accumulator::Sum(0.0),
            CombineKind::Min => Accumulator::Min(None),
            CombineKind::Max => Accumulator::Max(None),
            CombineKind::Distinct => Accumulator::Distinct(DistinctSketch::new()),
        }
    }

    pub fn kind(&self) -> CombineKind {
        match self {
            Accumulator::Count(_) => CombineKind::Count,
            Accumulator::Sum(_) => CombineKind::Sum,
            Accumulator::Min(_) => CombineKind::Min,
            Accumulator::Max(_) => CombineKind::Max,
            Accumulator::Distinct(_) => CombineKind::Distinct,
        }
    }

    /// Fold one contribution in
    pub fn apply(&mut self, contribution: &Contribution<'_>) {
        match (self, contribution) {
            (Accumulator::Count(n), _) => *n += 1,
            (Accumulator::Sum(total), Contribution::Number(v)) => *total += v,
            (Accumulator::Min(current), Contribution::Number(v)) => {
                *current = Some(current.map_or(*v, |c| c.min(*v)));
            }
            (Accumulator::Max(current), Contribution::Number(v)) => {
                *current = Some(current.map_or(*v, |c| c.max(*v)));
            }
            (Accumulator::Distinct(sketch), Contribution::Token(value)) => {
                sketch.insert(&value.canonical());
            }
            (Accumulator::Distinct(sketch), Contribution::Number(v)) => {
                sketch.insert(&v.to_string());
            }
            _ => {}
        }
    }

    /// Combine two accumulators of the same function
    pub fn merge(&mut self, other: &Accumulator) -> Result<()> {
        match (self, other) {
            (Accumulator::Count(a), Accumulator::Count(b)) => *a += b,
            (Accumulator::Sum(a), Accumulator::Sum(b)) => *a += b,
            (Accumulator::Min(a), Accumulator::Min(b)) => *a = merge_option(*a, *b, f64::min),
            (Accumulator::Max(a), Accumulator::Max(b)) => *a = merge_option(*a, *b, f64::max),
            (Accumulator::Distinct(a), Accumulator::Distinct(b)) => a.merge(b),
            (mine, theirs) => {
                return Err(Error::Internal(format!(
                    "cannot merge {:?} accumulator into {:?}",
                    theirs.kind(),
                    mine.kind()
                )))
            }
        }
        Ok(())
    }

    /// Current value as reported in aggregate records
    #[allow(clippy::cast_precision_loss)]
    pub fn value(&self) -> f64 {
        match self {
            Accumulator::Count(n) => *n as f64,
            Accumulator::Sum(total) => *total,
            Accumulator::Min(v) | Accumulator::Max(v) => v.unwrap_or(0.0),
            Accumulator::Distinct(sketch) => sketch.estimate().round(),
        }
    }
}

fn merge_option(a: Option<f64>, b: Option<f64>, pick: fn(f64, f64) -> f64) -> Option<f64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(pick(a, b)),
        (a, b) => a.or(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn purchase(amount: f64) -> Event {
        Event::new("e", "u1", "purchase", 0).with_property("amount", amount)
    }

    #[test]
    fn test_contribution_filters_by_event_type() {
        let spec = MetricSpec::count("purchases").for_event_type("purchase");
        assert_eq!(contribution(&spec, &purchase(1.0)), Some(Contribution::Occurrence));

        let view = Event::new("e", "u1", "page_view", 0);
        assert_eq!(contribution(&spec, &view), None);
    }

    #[test]
    fn test_contribution_requires_numeric_field() {
        let spec = MetricSpec::over("revenue", CombineKind::Sum, "amount");
        assert_eq!(contribution(&spec, &purchase(9.5)), Some(Contribution::Number(9.5)));

        let text = Event::new("e", "u1", "purchase", 0).with_property("amount", "lots");
        assert_eq!(contribution(&spec, &text), None);

        let missing = Event::new("e", "u1", "purchase", 0);
        assert_eq!(contribution(&spec, &missing), None);
    }

    #[test]
    fn test_accumulators() {
        let mut sum = Accumulator::new(CombineKind::Sum);
        let mut min = Accumulator::new(CombineKind::Min);
        let mut max = Accumulator::new(CombineKind::Max);
        for v in [3.0, -1.5, 7.0] {
            let c = Contribution::Number(v);
            sum.apply(&c);
            min.apply(&c);
            max.apply(&c);
        }
        assert_eq!(sum.value(), 8.5);
        assert_eq!(min.value(), -1.5);
        assert_eq!(max.value(), 7.0);
    }

    #[test]
    fn test_distinct_ignores_repeats() {
        let mut distinct = Accumulator::new(CombineKind::Distinct);
        let a = PropertyValue::from("page-a");
        let b = PropertyValue::from("page-b");
        for value in [&a, &b, &a, &a] {
            distinct.apply(&Contribution::Token(value));
        }
        assert_eq!(distinct.value(), 2.0);
    }

    #[test]
    fn test_merge() {
        let mut a = Accumulator::Count(2);
        a.merge(&Accumulator::Count(3)).unwrap();
        assert_eq!(a.value(), 5.0);

        let mut min = Accumulator::Min(None);
        min.merge(&Accumulator::Min(Some(4.0))).unwrap();
        assert_eq!(min, Accumulator::Min(Some(4.0)));

        assert!(a.merge(&Accumulator::Sum(1.0)).is_err());
    }
}
