mod check;
mod encode;
mod negotiate;
mod run;

use colored::Colorize;
use logrep_core::{StatsCounter, StatsSnapshot};

pub use check::cmd_check;
pub use encode::cmd_encode;
pub use negotiate::cmd_negotiate;
pub use run::cmd_run;

/// Print a counters table, one row per stats key.
fn print_stats(mut stats: Vec<StatsSnapshot>) {
    if stats.is_empty() {
        println!("No replication stats recorded.");
        return;
    }
    stats.sort_by_key(|s| s.key);

    println!("\n{}", "Replication Stats:".bold());
    print!("{:<28}", "Key");
    for counter in StatsCounter::ALL {
        print!(" {:>12}", counter.name());
    }
    println!();
    println!("{:-<1$}", "", 28 + 13 * StatsCounter::ALL.len());

    for snapshot in &stats {
        print!("{:<28}", snapshot.key.to_string());
        for counter in StatsCounter::ALL {
            let value = format!("{:>12}", snapshot.get(counter));
            if counter == StatsCounter::Conflict && snapshot.get(counter) > 0 {
                print!(" {}", value.red());
            } else {
                print!(" {}", value);
            }
        }
        println!();
    }
    println!();
}
