use std::path::Path;

use greengauge_core::leaderboard;

pub fn run(data: &str) {
    let store = super::open_store(Some(Path::new(data)));
    let entries = leaderboard(store.as_ref()).unwrap_or_else(|e| super::fail(e));

    if entries.is_empty() {
        println!("No users in {data}");
        return;
    }

    println!("{:>4} {:<20} {:>8} {:>16}", "RANK", "USER", "DEVICES", "MANUFACTURING kg");
    println!("{}", "-".repeat(51));
    for e in &entries {
        println!(
            "{:>4} {:<20} {:>8} {:>16.3}",
            e.rank, e.username, e.device_count, e.total_manufacturing_emission
        );
    }
}
