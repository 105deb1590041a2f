//! Work-list construction.

use chrono::NaiveDate;

use crate::models::Site;
use crate::state::WorkUnit;

/// Every date in `[start, end]`, ascending. Empty if `start > end`.
pub fn date_range(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    start.iter_days().take_while(|d| *d <= end).collect()
}

/// Ordered work list: sites outer, dates inner, chronological.
pub fn work_items(sites: &[Site], start: NaiveDate, end: NaiveDate) -> Vec<WorkUnit> {
    let dates = date_range(start, end);
    sites
        .iter()
        .flat_map(|site| {
            dates.iter().map(move |&date| WorkUnit {
                site_id: site.id,
                date,
            })
        })
        .collect()
}

/// Index of the first item to process after `last_completed`.
///
/// Returns 0 when there is no checkpoint or the unit is not in the list.
pub fn resume_index(items: &[WorkUnit], last_completed: Option<WorkUnit>) -> usize {
    last_completed
        .and_then(|last| items.iter().position(|u| *u == last))
        .map(|i| i + 1)
        .unwrap_or(0)
}
