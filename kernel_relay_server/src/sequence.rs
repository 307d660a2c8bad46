use std::sync::{Mutex, PoisonError};

/// Hands out request ids, shared by every connection of one server.
#[derive(Debug, Default)]
pub struct RequestSequence {
    counter: Mutex<u64>,
}

impl RequestSequence {
    pub fn next_id(&self) -> u64 {
        // A panic while holding this lock cannot leave the counter half-written.
        let mut counter = self.counter.lock().unwrap_or_else(PoisonError::into_inner);
        let id = *counter;
        *counter += 1;
        id
    }

    /// How many ids have been handed out so far.
    pub fn issued(&self) -> u64 {
        *self.counter.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn ids_start_at_zero_and_count_up() {
        let sequence = RequestSequence::default();
        assert_eq!(sequence.next_id(), 0);
        assert_eq!(sequence.next_id(), 1);
        assert_eq!(sequence.issued(), 2);
    }

    #[test]
    fn concurrent_callers_never_share_an_id() {
        let sequence = Arc::new(RequestSequence::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let sequence = Arc::clone(&sequence);
                thread::spawn(move || (0..1000).map(|_| sequence.next_id()).collect::<Vec<_>>())
            })
            .collect();

        let ids: HashSet<u64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        assert_eq!(ids.len(), 8000);
        assert_eq!(ids.iter().max(), Some(&7999));
        assert_eq!(sequence.issued(), 8000);
    }
}
