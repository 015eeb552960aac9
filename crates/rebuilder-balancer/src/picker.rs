use std::collections::VecDeque;

/// Round-robin picker over the currently known backend addresses.
///
/// Membership is mutated only by the resolver's polling loop; picks
/// rotate evenly through whatever the set currently holds.
pub struct RoundRobin {
    backends: VecDeque<String>,
}

impl RoundRobin {
    pub fn new(backends: Vec<String>) -> Self {
        Self {
            backends: VecDeque::from(backends),
        }
    }

    /// Get the next backend, rotating it to the back of the queue.
    pub fn next_backend(&mut self) -> Option<String> {
        let backend = self.backends.pop_front()?;
        self.backends.push_back(backend.clone());
        Some(backend)
    }

    /// Add a backend; duplicates are ignored.
    pub fn add_backend(&mut self, backend: String) {
        if !self.backends.contains(&backend) {
            self.backends.push_back(backend);
        }
    }

    pub fn remove_backend(&mut self, backend: &str) {
        self.backends.retain(|b| b != backend);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotates_through_backends_in_order() {
        let mut picker = RoundRobin::new(vec![
            "localhost:12311".to_string(),
            "localhost:12312".to_string(),
            "localhost:12313".to_string(),
        ]);

        assert_eq!(picker.next_backend().as_deref(), Some("localhost:12311"));
        assert_eq!(picker.next_backend().as_deref(), Some("localhost:12312"));
        assert_eq!(picker.next_backend().as_deref(), Some("localhost:12313"));
        // wraps around
        assert_eq!(picker.next_backend().as_deref(), Some("localhost:12311"));
    }

    #[test]
    fn empty_set_yields_none() {
        let mut picker = RoundRobin::new(vec![]);
        assert_eq!(picker.next_backend(), None);
    }

    #[test]
    fn duplicates_are_not_added() {
        let mut picker = RoundRobin::new(vec!["a".to_string()]);
        picker.add_backend("a".to_string());
        picker.add_backend("b".to_string());

        // A duplicate "a" would surface here as a,a,b.
        assert_eq!(picker.next_backend().as_deref(), Some("a"));
        assert_eq!(picker.next_backend().as_deref(), Some("b"));
        assert_eq!(picker.next_backend().as_deref(), Some("a"));
    }

    #[test]
    fn removal_keeps_rotation_consistent() {
        let mut picker =
            RoundRobin::new(vec!["a".to_string(), "b".to_string(), "c".to_string()]);
        picker.remove_backend("b");
        assert_eq!(picker.next_backend().as_deref(), Some("a"));
        assert_eq!(picker.next_backend().as_deref(), Some("c"));
        assert_eq!(picker.next_backend().as_deref(), Some("a"));
    }

    /// With K backends and M sequential picks, every backend is picked
    /// at least floor(M/K) times.
    #[test]
    fn rotation_is_fair() {
        use std::collections::HashMap;

        let k = 3;
        let m = 10;
        let mut picker = RoundRobin::new(
            (0..k).map(|i| format!("backend-{}", i)).collect(),
        );

        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..m {
            let backend = picker.next_backend().unwrap();
            *counts.entry(backend).or_default() += 1;
        }

        for i in 0..k {
            let count = counts.get(&format!("backend-{}", i)).copied().unwrap_or(0);
            assert!(
                count >= m / k,
                "backend-{} picked {} times, expected at least {}",
                i,
                count,
                m / k
            );
        }
    }
}
