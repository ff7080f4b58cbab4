//! `meshfw extract`: pull one target's image out of a release bundle

use anyhow::{Context, Result};
use meshfw_update::{DeviceHardware, UpdateConfig};

use super::{ExtractArgs, cancel_on_interrupt, file_store, output_path};
use crate::error::CliError;
use crate::output;

pub async fn execute(args: &ExtractArgs, config: &UpdateConfig, json: bool) -> Result<()> {
    if !args.archive.is_file() {
        return Err(CliError::InvalidArgument(format!(
            "archive not found: {}",
            args.archive.display()
        ))
        .into());
    }
    let extension = if args.ext.starts_with('.') {
        args.ext.clone()
    } else {
        format!(".{}", args.ext)
    };
    let hardware = DeviceHardware {
        platformio_target: args.target.clone(),
        ..Default::default()
    };

    let store = file_store(config)?;
    let cancel = cancel_on_interrupt();
    let outcome = async {
        let extracted = store
            .extract_firmware(&args.archive, &hardware, &extension, None, &cancel)
            .await
            .with_context(|| format!("Failed to read {}", args.archive.display()))?
            .ok_or_else(|| {
                CliError::NotFound(format!(
                    "no {extension} entry for {} in {}",
                    args.target,
                    args.archive.display()
                ))
            })?;
        let destination = output_path(&args.out, &extracted);
        let bytes = store
            .copy(&extracted, &destination, &cancel)
            .await
            .with_context(|| format!("Failed to write {}", destination.display()))?;
        Ok::<_, anyhow::Error>((destination, bytes))
    }
    .await;
    store.purge_all().await;

    let (destination, bytes) = outcome?;
    output::print_saved("extract", &destination, bytes, json)
}
