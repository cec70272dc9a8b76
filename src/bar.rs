//! Presentation bar model.
//!
//! Turns an `ActionFeed` into what the strip should show. An empty feed only
//! becomes "all caught up" after it has stayed empty for the grace delay, so
//! a domain that lands a moment later does not flash empty then populated.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::actions::ActionFeed;
use crate::types::{ActionCategory, ActionItem};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChipGroup {
    pub category: ActionCategory,
    pub items: Vec<ActionItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum BarView {
    Skeleton,
    AllCaughtUp,
    Chips { groups: Vec<ChipGroup> },
    /// Collapsed strip showing only how many things need attention.
    Collapsed { count: usize },
}

pub struct BarController {
    grace: Duration,
    collapsed: bool,
    empty_since: Option<Instant>,
}

impl BarController {
    pub fn new(grace: Duration, collapsed: bool) -> Self {
        Self {
            grace,
            collapsed,
            empty_since: None,
        }
    }

    pub fn set_collapsed(&mut self, collapsed: bool) {
        self.collapsed = collapsed;
    }

    pub fn is_collapsed(&self) -> bool {
        self.collapsed
    }

    pub fn view(&mut self, feed: &ActionFeed, now: Instant) -> BarView {
        if !feed.ready {
            self.empty_since = None;
            return BarView::Skeleton;
        }

        if feed.empty {
            let since = *self.empty_since.get_or_insert(now);
            return if now.duration_since(since) >= self.grace {
                BarView::AllCaughtUp
            } else {
                BarView::Skeleton
            };
        }

        self.empty_since = None;
        if self.collapsed {
            let count = feed.items.iter().map(|i| i.count.unwrap_or(1)).sum();
            return BarView::Collapsed { count };
        }
        BarView::Chips {
            groups: group_by_category(&feed.items),
        }
    }

    /// When the view will change without a new feed (end of the grace delay).
    pub fn next_wakeup(&self, now: Instant) -> Option<Instant> {
        self.empty_since
            .map(|since| since + self.grace)
            .filter(|deadline| *deadline > now)
    }
}

fn group_by_category(items: &[ActionItem]) -> Vec<ChipGroup> {
    [
        ActionCategory::Critical,
        ActionCategory::Standard,
        ActionCategory::Success,
    ]
    .into_iter()
    .filter_map(|category| {
        let items: Vec<ActionItem> = items
            .iter()
            .filter(|i| i.category == category)
            .cloned()
            .collect();
        (!items.is_empty()).then_some(ChipGroup { category, items })
    })
    .collect()
}

impl fmt::Display for BarView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BarView::Skeleton => f.write_str("[loading...]"),
            BarView::AllCaughtUp => f.write_str("[all caught up]"),
            BarView::Collapsed { count } => write!(f, "[{} to do]", count),
            BarView::Chips { groups } => {
                let mut first = true;
                for group in groups {
                    for item in &group.items {
                        if !first {
                            f.write_str(" | ")?;
                        }
                        first = false;
                        if group.category == ActionCategory::Critical {
                            f.write_str("! ")?;
                        }
                        f.write_str(&item.title)?;
                        if let Some(count) = item.count.filter(|c| *c > 1) {
                            write!(f, " ({})", count)?;
                        }
                        if let Some(subtitle) = &item.subtitle {
                            write!(f, " - {}", subtitle)?;
                        }
                    }
                }
                Ok(())
            }
        }
    }
}
