//! Highest Random Weight selection

use nimbus_common::{DaemonInfo, Smap};
use xxhash_rust::xxh64::Xxh64;

/// Score of `candidate` for `key`: xxHash64 over the key bytes followed by
/// the candidate identifier bytes.
#[must_use]
pub fn hrw_score(key: &str, candidate: &str) -> u64 {
    let mut hasher = Xxh64::new(0);
    hasher.update(key.as_bytes());
    hasher.update(candidate.as_bytes());
    hasher.digest()
}

/// Pick the candidate with the highest score for `key`.
///
/// `id` maps a candidate to the identifier that is hashed. Equal scores are
/// broken by the larger identifier so the result never depends on iteration
/// order. Returns `None` only for an empty candidate set.
pub fn hrw_select<'a, T, I, F>(key: &str, candidates: I, id: F) -> Option<&'a T>
where
    I: IntoIterator<Item = &'a T>,
    F: Fn(&T) -> &str,
    T: ?Sized + 'a,
{
    candidates
        .into_iter()
        .map(|c| (hrw_score(key, id(c)), c))
        .max_by(|(sa, a), (sb, b)| sa.cmp(sb).then_with(|| id(a).cmp(id(b))))
        .map(|(_, c)| c)
}

/// Owning target of `key` under the cluster map
#[must_use]
pub fn hrw_target<'a>(key: &str, smap: &'a Smap) -> Option<&'a DaemonInfo> {
    hrw_select(key, smap.targets.values(), |t| t.daemon_id.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::collections::HashMap;

    fn random_key(rng: &mut impl Rng) -> String {
        let n: u64 = rng.r#gen();
        format!("bucket-{}/obj-{n:x}", n % 7)
    }

    #[test]
    fn test_hrw_deterministic() {
        let mpaths = vec!["/mnt/a", "/mnt/b", "/mnt/c", "/mnt/d"];
        let mut reversed = mpaths.clone();
        reversed.reverse();

        for i in 0..200 {
            let key = format!("b/o{i}");
            let p1 = hrw_select(&key, mpaths.iter(), |m| *m);
            let p2 = hrw_select(&key, mpaths.iter(), |m| *m);
            let p3 = hrw_select(&key, reversed.iter(), |m| *m);
            assert_eq!(p1, p2);
            assert_eq!(p1, p3, "placement must not depend on candidate order");
        }
    }

    #[test]
    fn test_hrw_empty() {
        let none: Vec<String> = Vec::new();
        assert!(hrw_select("b/o", none.iter(), String::as_str).is_none());
    }

    #[test]
    fn test_hrw_stability_on_removal() {
        let all = vec!["/mnt/a", "/mnt/b", "/mnt/c", "/mnt/d"];
        let remaining: Vec<_> = all.iter().copied().filter(|m| *m != "/mnt/c").collect();
        let mut rng = rand::thread_rng();

        let mut moved = 0;
        for _ in 0..2000 {
            let key = random_key(&mut rng);
            let before = *hrw_select(&key, all.iter(), |m| *m).unwrap();
            let after = *hrw_select(&key, remaining.iter(), |m| *m).unwrap();
            if before == "/mnt/c" {
                moved += 1;
            } else {
                assert_eq!(before, after, "key {key} moved off a surviving mount");
            }
        }
        assert!(moved > 0);
    }

    #[test]
    fn test_hrw_balance() {
        let mpaths: Vec<String> = (0..8).map(|i| format!("/mnt/disk{i}")).collect();
        let mut counts: HashMap<&str, usize> = HashMap::new();
        let mut rng = rand::thread_rng();

        for _ in 0..8000 {
            let key = random_key(&mut rng);
            let chosen = hrw_select(&key, mpaths.iter(), String::as_str).unwrap();
            *counts.entry(chosen.as_str()).or_default() += 1;
        }

        // ~1000 per mount; allow 30% variance
        assert_eq!(counts.len(), 8);
        for count in counts.values() {
            assert!(
                *count > 700 && *count < 1300,
                "Unbalanced selection: {count} (expected ~1000)"
            );
        }
    }

    #[test]
    fn test_hrw_target() {
        let mut smap = Smap {
            version: 1,
            ..Smap::default()
        };
        assert!(hrw_target("b/o", &smap).is_none());

        for id in ["t1", "t2", "t3"] {
            smap.targets.insert(
                id.to_string(),
                DaemonInfo {
                    daemon_id: id.to_string(),
                    direct_url: format!("http://{id}:8081"),
                },
            );
        }
        let owner = hrw_target("b/o", &smap).unwrap();
        assert_eq!(owner, hrw_target("b/o", &smap).unwrap());
        assert!(smap.contains(&owner.daemon_id));
    }
}
