//! Generate Mermaid state diagrams from the Beiboot and Shelf TRANSITIONS tables.
//!
//! Usage:
//!   cargo run --bin statemachine_diagram                        # stdout
//!   cargo run --bin statemachine_diagram -- --out STATE_MACHINE.md

use std::fmt::Display;
use std::path::PathBuf;

use beiboot_operator::controller::{shelf_machine, state_machine};

fn main() -> anyhow::Result<()> {
    let out: Option<PathBuf> = std::env::args()
        .skip_while(|a| a != "--out")
        .nth(1)
        .map(PathBuf::from);

    let mut md = String::new();
    md.push_str("# State Machines\n\n");
    md.push_str("Auto-generated from the `TRANSITIONS` tables in `controller/state_machine.rs`\n");
    md.push_str("and `controller/shelf_machine.rs`.\n\n");
    md.push_str(&diagram(
        "Beiboot",
        state_machine::TRANSITIONS.iter().map(|t| (t.from, t.event, t.to)),
    ));
    md.push('\n');
    md.push_str(&diagram(
        "Shelf",
        shelf_machine::TRANSITIONS.iter().map(|t| (t.from, t.event, t.to)),
    ));

    match out {
        Some(path) => {
            std::fs::write(&path, &md)?;
            eprintln!("wrote {}", path.display());
        }
        None => print!("{md}"),
    }
    Ok(())
}

fn diagram<S, E>(title: &str, rows: impl Iterator<Item = (S, E, S)>) -> String
where
    S: Display + Default,
    E: Display,
{
    let mut out = format!("## {title}\n\n```mermaid\nstateDiagram-v2\n");
    out.push_str(&format!("    [*] --> {}\n\n", S::default()));

    let mut current_from = String::new();
    for (from, event, to) in rows {
        let from = from.to_string();
        if from != current_from {
            if !current_from.is_empty() {
                out.push('\n');
            }
            current_from = from.clone();
        }
        out.push_str(&format!("    {from} --> {to} : {event}\n"));
    }

    out.push_str("```\n");
    out
}
