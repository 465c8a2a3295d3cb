//! Annotation keys under which each result category is published on a subject.

/// Shared by every key below, so readers can pick them out of a subject's annotations.
pub const PREFIX: &str = "scheduler-simulator/";

macro_rules! key {
    ($suffix:literal) => {
        concat!("scheduler-simulator/", $suffix)
    };
}

/// Pre-filter status per plugin.
pub const PRE_FILTER_STATUS: &str = key!("prefilter-result-status");
/// Target names a pre-filter plugin narrowed the run down to.
pub const PRE_FILTER_RESULT: &str = key!("prefilter-result");
/// Filtering result per target and plugin.
pub const FILTER: &str = key!("filter-result");
pub const POST_FILTER: &str = key!("postFilter-result");
pub const PRE_SCORE: &str = key!("prescore-result");
/// Raw score per target and plugin.
pub const SCORE: &str = key!("score-result");
/// Final score (normalized and weighted) per target and plugin.
pub const FINAL_SCORE: &str = key!("finalscore-result");
pub const PERMIT: &str = key!("permit-result");
pub const PERMIT_TIMEOUT: &str = key!("permit-result-timeout");
pub const RESERVE: &str = key!("reserve-result");
pub const PRE_BIND: &str = key!("prebind-result");
pub const BIND: &str = key!("bind-result");
/// The target chosen for the subject.
pub const SELECTED_TARGET: &str = key!("selected-node");
/// JSON array of every result set reflected on the subject so far.
pub const RESULT_HISTORY: &str = key!("result-history");

/// Every stage category `ResultStore::get_stored_result` always emits.
pub const ALL_STAGE_KEYS: [&str; 13] = [
    PRE_FILTER_STATUS,
    PRE_FILTER_RESULT,
    FILTER,
    POST_FILTER,
    PRE_SCORE,
    SCORE,
    FINAL_SCORE,
    PERMIT,
    PERMIT_TIMEOUT,
    RESERVE,
    PRE_BIND,
    BIND,
    SELECTED_TARGET,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_share_prefix() {
        for key in ALL_STAGE_KEYS.iter().chain([&RESULT_HISTORY]) {
            assert!(key.starts_with(PREFIX), "{} lacks the prefix", key);
        }
        assert_eq!(FILTER, "scheduler-simulator/filter-result");
        assert_eq!(POST_FILTER, "scheduler-simulator/postFilter-result");
        assert_eq!(FINAL_SCORE, "scheduler-simulator/finalscore-result");
    }
}
