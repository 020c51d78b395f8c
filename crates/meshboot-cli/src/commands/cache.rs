use std::path::Path;

use anyhow::{Context, bail};
use meshboot_cache::{SecretCache, SecretStore};

fn open(path: &Path) -> anyhow::Result<SecretStore> {
    if !path.exists() {
        bail!("no cache at {}", path.display());
    }
    SecretStore::open(path).with_context(|| format!("opening cache {}", path.display()))
}

pub fn list(path: &Path, format: &str) -> anyhow::Result<()> {
    let names = open(path)?.names()?;
    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&names)?);
        }
        _ => {
            for name in &names {
                println!("{name}");
            }
        }
    }
    Ok(())
}

pub fn forget(path: &Path, name: &str) -> anyhow::Result<()> {
    let store = open(path)?;
    if store.load(name)?.is_empty() {
        println!("{name} is not cached");
        return Ok(());
    }
    store.delete(name)?;
    println!("✓ Forgot {name}");
    Ok(())
}
