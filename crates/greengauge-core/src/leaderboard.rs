//! Users ranked by the total manufacturing emission of their devices.
//!
//! Built in one pass over the user and device lists; lowest total ranks
//! first. Devices with no manufacturing profile count as zero.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::ids::UserId;
use crate::store::SessionStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    /// 1-based position.
    pub rank: usize,
    pub user_id: UserId,
    pub username: String,
    pub total_manufacturing_emission: f64,
    pub device_count: usize,
}

pub fn leaderboard(store: &dyn SessionStore) -> Result<Vec<LeaderboardEntry>> {
    let mut totals: HashMap<UserId, (f64, usize)> = HashMap::new();
    for device in store.devices()? {
        let entry = totals.entry(device.user_id).or_default();
        entry.0 += device
            .manufacturing
            .map_or(0.0, |m| m.manufacturing_emission);
        entry.1 += 1;
    }

    let mut entries: Vec<LeaderboardEntry> = store
        .users()?
        .into_iter()
        .map(|user| {
            let (total, count) = totals.get(&user.user_id).copied().unwrap_or_default();
            LeaderboardEntry {
                rank: 0,
                user_id: user.user_id,
                username: user.username,
                total_manufacturing_emission: total,
                device_count: count,
            }
        })
        .collect();

    entries.sort_by(|a, b| {
        a.total_manufacturing_emission
            .total_cmp(&b.total_manufacturing_emission)
    });
    for (i, entry) in entries.iter_mut().enumerate() {
        entry.rank = i + 1;
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emissions::ManufacturingEmissionProfile;
    use crate::store::{MemoryStore, NewDevice};

    fn add_device(store: &MemoryStore, user: UserId, emission: Option<f64>) {
        let device = store
            .insert_device(NewDevice {
                user_id: user,
                kind: "laptop".into(),
                manufacturer: "Acme".into(),
                model: "One".into(),
            })
            .unwrap();
        if let Some(gwp) = emission {
            store
                .set_manufacturing(ManufacturingEmissionProfile::compute(device, 1.0, gwp).unwrap())
                .unwrap();
        }
    }

    #[test]
    fn test_ascending_with_stable_ties() {
        let store = MemoryStore::new();
        let a = store.insert_user("A").unwrap();
        let b = store.insert_user("B").unwrap();
        let c = store.insert_user("C").unwrap();
        add_device(&store, a, Some(10.0));
        add_device(&store, b, Some(5.0));
        add_device(&store, c, Some(5.0));

        let board = leaderboard(&store).unwrap();
        let names: Vec<&str> = board.iter().map(|e| e.username.as_str()).collect();
        assert_eq!(names, vec!["B", "C", "A"]);
        assert_eq!(board[0].rank, 1);
        assert_eq!(board[2].rank, 3);
    }

    #[test]
    fn test_user_without_devices_totals_zero() {
        let store = MemoryStore::new();
        let a = store.insert_user("A").unwrap();
        store.insert_user("idle").unwrap();
        add_device(&store, a, Some(3.0));

        let board = leaderboard(&store).unwrap();
        assert_eq!(board[0].username, "idle");
        assert_eq!(board[0].total_manufacturing_emission, 0.0);
        assert_eq!(board[0].device_count, 0);
    }

    #[test]
    fn test_device_without_profile_counts_zero() {
        let store = MemoryStore::new();
        let a = store.insert_user("A").unwrap();
        add_device(&store, a, None);
        add_device(&store, a, Some(7.5));

        let board = leaderboard(&store).unwrap();
        assert_eq!(board[0].total_manufacturing_emission, 7.5);
        assert_eq!(board[0].device_count, 2);
    }

    #[test]
    fn test_empty_store() {
        assert!(leaderboard(&MemoryStore::new()).unwrap().is_empty());
    }
}
