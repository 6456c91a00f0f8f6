//! Print the CustomResourceDefinitions as a multi-document YAML stream.
//!
//! Usage:
//!   cargo run --bin crdgen                       # stdout
//!   cargo run --bin crdgen -- --out-dir deploy/  # one file per kind

use std::path::PathBuf;

use kube::CustomResourceExt;

use beiboot_operator::crd::beiboot::Beiboot;
use beiboot_operator::crd::shelf::Shelf;

fn main() -> anyhow::Result<()> {
    let out_dir: Option<PathBuf> = std::env::args()
        .skip_while(|a| a != "--out-dir")
        .nth(1)
        .map(PathBuf::from);

    let crds = [
        ("beiboot", serde_yaml::to_string(&Beiboot::crd())?),
        ("shelf", serde_yaml::to_string(&Shelf::crd())?),
    ];

    match out_dir {
        Some(dir) => {
            std::fs::create_dir_all(&dir)?;
            for (kind, yaml) in &crds {
                let path = dir.join(format!("{kind}-crd.yaml"));
                std::fs::write(&path, yaml)?;
                eprintln!("wrote {}", path.display());
            }
        }
        None => {
            for (_, yaml) in &crds {
                print!("---\n{yaml}");
            }
        }
    }
    Ok(())
}
