//! Campaign definitions as consumed by the engine.
//!
//! Steps arrive with a free-text day label (`"immediately"`, `"Day 5"`, ...).
//! The label is parsed once, when the campaign is loaded, into a [`DayOffset`]
//! and the steps are put into send order. Ticks only ever see the parsed form.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::db::CampaignRecord;
use crate::types::CampaignId;

/// Largest day label accepted as scheduled; anything beyond is `Unscheduled`.
pub const MAX_DAY_OFFSET: u32 = 36_500;

/// When a step is sent, relative to the enrollment's anchor date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DayOffset {
    Immediate,
    Day(u32),
    /// The label carried no usable day; ordered after every scheduled step.
    Unscheduled,
}

impl DayOffset {
    /// Parse a step's day label.
    ///
    /// The first run of digits wins, so `"Day 5"`, `"day5"` and `"5"` are all
    /// `Day(5)`; a zero day is `Immediate`. Days past [`MAX_DAY_OFFSET`] are
    /// `Unscheduled`.
    pub fn parse(label: &str) -> Self {
        let lower = label.trim().to_ascii_lowercase();
        if lower.is_empty() {
            return Self::Unscheduled;
        }
        if lower.starts_with("immediate") || lower == "now" {
            return Self::Immediate;
        }

        let digits: String = lower
            .chars()
            .skip_while(|c| !c.is_ascii_digit())
            .take_while(|c| c.is_ascii_digit())
            .collect();

        match digits.parse::<u32>() {
            Ok(n) => Self::from_day(n),
            Err(_) => Self::Unscheduled,
        }
    }

    fn from_day(n: u32) -> Self {
        match n {
            0 => Self::Immediate,
            n if n <= MAX_DAY_OFFSET => Self::Day(n),
            _ => Self::Unscheduled,
        }
    }

    /// Day number used for ordering and schedule arithmetic.
    ///
    /// `Unscheduled` has no day of its own; callers decide what it means.
    pub fn day(&self) -> Option<u32> {
        match self {
            Self::Immediate => Some(0),
            Self::Day(n) => Some(*n),
            Self::Unscheduled => None,
        }
    }

    fn sort_key(&self) -> (u8, u32) {
        match self {
            Self::Immediate => (0, 0),
            Self::Day(n) => (0, *n),
            Self::Unscheduled => (1, 0),
        }
    }
}

impl Ord for DayOffset {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl PartialOrd for DayOffset {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Raw day label as stored on a campaign document: text or a bare number.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawDay {
    Number(u32),
    Text(String),
}

impl RawDay {
    pub fn offset(&self) -> DayOffset {
        match self {
            Self::Number(n) => DayOffset::from_day(*n),
            Self::Text(s) => DayOffset::parse(s),
        }
    }
}

/// Step exactly as declared on the campaign document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawStep {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub day: Option<RawDay>,
}

/// A step in send order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CampaignStep {
    pub text: String,
    pub offset: DayOffset,
    /// Position of the step on the campaign document.
    pub declared_index: usize,
}

/// Reasons a campaign cannot drive sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CampaignProblem {
    Missing,
    Inactive,
    NotMessaging,
}

impl std::fmt::Display for CampaignProblem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Missing => write!(f, "campaign not found"),
            Self::Inactive => write!(f, "campaign is inactive"),
            Self::NotMessaging => write!(f, "campaign is not a messaging campaign"),
        }
    }
}

/// A loaded campaign with its steps parsed and ordered.
#[derive(Debug, Clone)]
pub struct Campaign {
    pub id: CampaignId,
    pub name: Option<String>,
    pub agent_name: Option<String>,
    pub steps: Vec<CampaignStep>,
}

impl Campaign {
    /// Build the engine view of a campaign document, refusing campaigns that
    /// are inactive or not message campaigns.
    pub fn from_record(id: CampaignId, record: CampaignRecord) -> Result<Self, CampaignProblem> {
        if !record.active {
            return Err(CampaignProblem::Inactive);
        }
        if !is_message_kind(record.kind.as_deref()) {
            return Err(CampaignProblem::NotMessaging);
        }

        Ok(Self {
            id,
            name: record.name,
            agent_name: record.agent_name,
            steps: order_steps(&record.steps),
        })
    }

    pub fn step(&self, index: usize) -> Option<&CampaignStep> {
        self.steps.get(index)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Day on which step `index` is sent.
    ///
    /// Unscheduled steps inherit the day of the step before them, so they go
    /// out right after it.
    pub fn effective_day(&self, index: usize) -> u32 {
        if self.steps.is_empty() {
            return 0;
        }
        self.steps[..=index.min(self.steps.len() - 1)]
            .iter()
            .rev()
            .find_map(|s| s.offset.day())
            .unwrap_or(0)
    }
}

/// Campaign kinds that send text messages. A missing kind is treated as SMS,
/// which is what campaigns created before the discriminator existed are.
pub fn is_message_kind(kind: Option<&str>) -> bool {
    match kind {
        None => true,
        Some(k) => matches!(k.trim().to_ascii_lowercase().as_str(), "sms" | "message" | "text" | ""),
    }
}

/// Parse and stably order declared steps by day offset.
pub fn order_steps(raw: &[RawStep]) -> Vec<CampaignStep> {
    let mut steps: Vec<CampaignStep> = raw
        .iter()
        .enumerate()
        .map(|(declared_index, step)| CampaignStep {
            text: step.text.clone(),
            offset: step
                .day
                .as_ref()
                .map(RawDay::offset)
                .unwrap_or(DayOffset::Immediate),
            declared_index,
        })
        .collect();

    // `sort_by` is stable, so equal offsets keep declaration order.
    steps.sort_by(|a, b| a.offset.cmp(&b.offset));
    steps
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(text: &str, day: &str) -> RawStep {
        RawStep {
            text: text.to_string(),
            day: Some(RawDay::Text(day.to_string())),
        }
    }

    #[test]
    fn test_parse_labels() {
        assert_eq!(DayOffset::parse("immediately"), DayOffset::Immediate);
        assert_eq!(DayOffset::parse("Immediate"), DayOffset::Immediate);
        assert_eq!(DayOffset::parse("Day 5"), DayOffset::Day(5));
        assert_eq!(DayOffset::parse("day12"), DayOffset::Day(12));
        assert_eq!(DayOffset::parse("3"), DayOffset::Day(3));
        assert_eq!(DayOffset::parse("Day 0"), DayOffset::Immediate);
        assert_eq!(DayOffset::parse("someday"), DayOffset::Unscheduled);
        assert_eq!(DayOffset::parse(""), DayOffset::Unscheduled);
    }

    #[test]
    fn test_out_of_range_days_are_unscheduled() {
        assert_eq!(DayOffset::parse("Day 36500"), DayOffset::Day(MAX_DAY_OFFSET));
        assert_eq!(DayOffset::parse("Day 100000000"), DayOffset::Unscheduled);
        assert_eq!(DayOffset::parse("Day 99999999999999"), DayOffset::Unscheduled);
        assert_eq!(RawDay::Number(100_000_000).offset(), DayOffset::Unscheduled);
        assert_eq!(RawDay::Number(0).offset(), DayOffset::Immediate);
    }

    #[test]
    fn test_numeric_not_lexicographic_order() {
        let steps = order_steps(&[
            raw("ten", "Day 10"),
            raw("now", "immediately"),
            raw("two", "Day 2"),
        ]);

        let texts: Vec<&str> = steps.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(texts, vec!["now", "two", "ten"]);
    }

    #[test]
    fn test_ties_keep_declaration_order() {
        let steps = order_steps(&[
            raw("a", "Day 2"),
            raw("b", "Day 1"),
            raw("c", "Day 2"),
            raw("d", "whenever"),
            raw("e", "Day 1"),
        ]);

        let texts: Vec<&str> = steps.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(texts, vec!["b", "e", "a", "c", "d"]);
    }

    #[test]
    fn test_numeric_day_values() {
        let steps = order_steps(&[
            RawStep { text: "x".into(), day: Some(RawDay::Number(4)) },
            RawStep { text: "y".into(), day: Some(RawDay::Number(0)) },
            RawStep { text: "z".into(), day: None },
        ]);

        assert_eq!(steps[0].offset, DayOffset::Immediate);
        assert_eq!(steps[1].offset, DayOffset::Immediate);
        assert_eq!(steps[2].offset, DayOffset::Day(4));
        assert_eq!(steps[2].declared_index, 0);
    }

    #[test]
    fn test_raw_day_deserializes_text_or_number() {
        let steps: Vec<RawStep> =
            serde_json::from_str(r#"[{"text":"a","day":"Day 3"},{"text":"b","day":7},{"text":"c"}]"#).unwrap();
        assert_eq!(steps[0].day.as_ref().unwrap().offset(), DayOffset::Day(3));
        assert_eq!(steps[1].day.as_ref().unwrap().offset(), DayOffset::Day(7));
        assert!(steps[2].day.is_none());
    }

    #[test]
    fn test_message_kinds() {
        assert!(is_message_kind(None));
        assert!(is_message_kind(Some("SMS")));
        assert!(is_message_kind(Some("message")));
        assert!(!is_message_kind(Some("voice")));
        assert!(!is_message_kind(Some("email")));
    }

    #[test]
    fn test_effective_day_for_unscheduled() {
        let campaign = Campaign {
            id: CampaignId::new("c"),
            name: None,
            agent_name: None,
            steps: order_steps(&[raw("a", "Day 4"), raw("b", "later")]),
        };
        assert_eq!(campaign.effective_day(0), 4);
        assert_eq!(campaign.effective_day(1), 4);
    }
}
