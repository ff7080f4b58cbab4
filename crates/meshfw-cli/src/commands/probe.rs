//! `meshfw probe`: HEAD a firmware URL

use anyhow::Result;
use meshfw_update::UpdateConfig;

use super::file_store;
use crate::error::CliError;
use crate::output;

pub async fn execute(url: &str, config: &UpdateConfig, json: bool) -> Result<()> {
    let exists = file_store(config)?.check_url_exists(url).await;
    output::print_probe(url, exists, json)?;
    if exists {
        Ok(())
    } else {
        Err(CliError::NotFound(url.to_string()).into())
    }
}
