//! Process selection algorithm (§4.2.1).

use crate::pool::process::Process;

pub enum Selection {
    /// Selected this index into `enabled_processes`.
    Found(usize),
    /// A sticky id was given and a matching process exists, but it is
    /// totally busy; the caller should wait rather than pick a different
    /// process.
    StickyBusy,
    /// No eligible process; caller should enqueue.
    None,
}

/// Mirrors the Group's `enabled_processes` + parallel busyness vector.
/// Kept free of `Group` so it can be unit tested against plain slices.
pub fn select(processes: &[Process], sticky_id: Option<u32>) -> Selection {
    if let Some(id) = sticky_id {
        if let Some(idx) = processes.iter().position(|p| p.sticky_session_id == Some(id)) {
            return if processes[idx].is_totally_busy() {
                Selection::StickyBusy
            } else {
                Selection::Found(idx)
            };
        }
    }

    processes
        .iter()
        .enumerate()
        .filter(|(_, p)| !p.is_totally_busy())
        .min_by_key(|(idx, p)| (p.busyness(), *idx))
        .map(|(idx, _)| Selection::Found(idx))
        .unwrap_or(Selection::None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::socket::{Protocol, Socket};
    use crate::types::{GroupKey, GupId, SocketName};
    use chrono::Utc;

    fn process_with_sessions(concurrency: u32, sessions: u32) -> Process {
        let mut socket = Socket::new(
            SocketName::from_string("main"),
            "unix:/tmp/x.sock".to_string(),
            Protocol::Http,
            concurrency,
        );
        for _ in 0..sessions {
            socket.checkout();
        }
        Process::new(
            GroupKey::from_string("g1"),
            1,
            GupId::new(),
            vec![socket],
            None,
            Utc::now(),
            0,
        )
    }

    #[test]
    fn picks_least_busy_process() {
        let processes = vec![
            process_with_sessions(5, 3),
            process_with_sessions(5, 1),
            process_with_sessions(5, 4),
        ];
        match select(&processes, None) {
            Selection::Found(idx) => assert_eq!(idx, 1),
            _ => panic!("expected a selection"),
        }
    }

    #[test]
    fn ties_break_toward_lowest_index() {
        let processes = vec![process_with_sessions(5, 2), process_with_sessions(5, 2)];
        match select(&processes, None) {
            Selection::Found(idx) => assert_eq!(idx, 0),
            _ => panic!("expected a selection"),
        }
    }

    #[test]
    fn totally_busy_processes_are_skipped() {
        let processes = vec![process_with_sessions(1, 1), process_with_sessions(2, 1)];
        match select(&processes, None) {
            Selection::Found(idx) => assert_eq!(idx, 1),
            _ => panic!("expected a selection"),
        }
    }

    #[test]
    fn no_eligible_process_returns_none() {
        let processes = vec![process_with_sessions(1, 1)];
        assert!(matches!(select(&processes, None), Selection::None));
    }

    #[test]
    fn sticky_match_wins_even_if_not_least_busy() {
        let mut processes = vec![process_with_sessions(5, 0), process_with_sessions(5, 2)];
        processes[1].sticky_session_id = Some(99);
        match select(&processes, Some(99)) {
            Selection::Found(idx) => assert_eq!(idx, 1),
            _ => panic!("expected sticky match"),
        }
    }

    #[test]
    fn sticky_match_totally_busy_reports_busy_not_fallback() {
        let mut processes = vec![process_with_sessions(5, 0), process_with_sessions(1, 1)];
        processes[1].sticky_session_id = Some(99);
        assert!(matches!(select(&processes, Some(99)), Selection::StickyBusy));
    }

    #[test]
    fn sticky_miss_falls_back_to_normal_selection() {
        let processes = vec![process_with_sessions(5, 0)];
        match select(&processes, Some(123)) {
            Selection::Found(idx) => assert_eq!(idx, 0),
            _ => panic!("expected fallback selection"),
        }
    }
}
