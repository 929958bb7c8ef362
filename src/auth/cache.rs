use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// How long a verdict stays authoritative before the backend is asked again.
const VERDICT_TTL: Duration = Duration::from_secs(60);

/// Credential-to-verdict cache shared by every connection worker.
///
/// Expiry is lazy: entries are dropped when a read finds them stale, there is
/// no background sweeper. A stale read counts as a miss.
pub struct VerdictCache {
    entries: Mutex<HashMap<String, (bool, Instant)>>,
    ttl: Duration,
}

impl VerdictCache {
    pub fn new() -> Self {
        Self::with_ttl(VERDICT_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn get(&self, credential: &str) -> Option<bool> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let (verdict, stored) = *entries.get(credential)?;
        if stored.elapsed() < self.ttl {
            Some(verdict)
        } else {
            entries.remove(credential);
            None
        }
    }

    pub fn put(&self, credential: String, verdict: bool) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(credential, (verdict, Instant::now()));
    }
}

impl Default for VerdictCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stores_and_returns_verdicts() {
        let cache = VerdictCache::new();
        cache.put("alpha".to_string(), true);
        cache.put("beta".to_string(), false);

        assert_eq!(cache.get("alpha"), Some(true));
        assert_eq!(cache.get("beta"), Some(false));
        assert_eq!(cache.get("gamma"), None);
    }

    #[test]
    fn expired_entries_read_as_absent() {
        let cache = VerdictCache::with_ttl(Duration::ZERO);
        cache.put("alpha".to_string(), true);

        assert_eq!(cache.get("alpha"), None);
    }

    #[test]
    fn put_refreshes_an_existing_entry() {
        let cache = VerdictCache::new();
        cache.put("alpha".to_string(), false);
        cache.put("alpha".to_string(), true);

        assert_eq!(cache.get("alpha"), Some(true));
    }
}
