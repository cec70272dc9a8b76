//! Static ordering of immediate actions.
//!
//! Lower rank shows first. Titles missing from the table go last, in the
//! order they were discovered.

pub const CONFIRM_ATTENDANCE: &str = "Confirm Attendance";
pub const APPROVE_LEAVE: &str = "Approve Annual Leave";
pub const BOOK_LEAVE: &str = "Book Requested Leave";
pub const ALLOCATE_DOCUMENTS: &str = "Allocate Documents";
pub const APPROVE_SNIPPET_EDITS: &str = "Approve Snippet Edits";
pub const LOCAL_TEST_ACTION: &str = "Test Immediate Action";

pub const UNRANKED: u32 = u32::MAX;

const PRIORITY_TABLE: &[(&str, u32)] = &[
    (CONFIRM_ATTENDANCE, 1),
    (APPROVE_LEAVE, 2),
    (BOOK_LEAVE, 3),
    ("Verify ID", 4),
    ("Assess Risk", 5),
    ("Review Payment", 6),
    ("Draft CCL", 7),
    ("Open Matter", 8),
    ("Review Instruction", 9),
    (ALLOCATE_DOCUMENTS, 10),
    (APPROVE_SNIPPET_EDITS, 11),
    (LOCAL_TEST_ACTION, 50),
];

pub fn priority_of(title: &str) -> u32 {
    PRIORITY_TABLE
        .iter()
        .find(|(t, _)| t.eq_ignore_ascii_case(title.trim()))
        .map(|(_, rank)| *rank)
        .unwrap_or(UNRANKED)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_titles_ranked() {
        assert!(priority_of(CONFIRM_ATTENDANCE) < priority_of(APPROVE_LEAVE));
        assert_eq!(priority_of("verify id"), 4);
    }

    #[test]
    fn test_unknown_title_goes_last() {
        assert_eq!(priority_of("Chase Counterparty"), UNRANKED);
        assert!(priority_of(LOCAL_TEST_ACTION) < UNRANKED);
    }

    #[test]
    fn test_table_has_no_duplicate_titles() {
        let mut titles: Vec<_> = PRIORITY_TABLE.iter().map(|(t, _)| t.to_lowercase()).collect();
        titles.sort();
        titles.dedup();
        assert_eq!(titles.len(), PRIORITY_TABLE.len());
    }
}
