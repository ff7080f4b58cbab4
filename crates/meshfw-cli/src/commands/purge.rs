//! `meshfw purge`: clear the scratch directory

use anyhow::Result;
use meshfw_update::UpdateConfig;
use serde_json::json;

use super::file_store;
use crate::output;

pub async fn execute(config: &UpdateConfig, json: bool) -> Result<()> {
    let store = file_store(config)?;
    store.purge_all().await;
    if json {
        return output::print_json(json!({
            "success": true,
            "action": "purge",
            "scratch_dir": store.scratch_dir().display().to_string(),
        }));
    }
    println!("Cleared {}", store.scratch_dir().display());
    Ok(())
}
