//! `meshfw fetch`: resolve a firmware artifact the way an update would

use anyhow::{Context, Result};
use meshfw_update::{
    DeviceHardware, FirmwareRelease, FirmwareRetriever, FirmwareUpdateError, UpdateConfig,
};
use tracing::info;

use super::{FetchArgs, Method, cancel_on_interrupt, file_store, output_path};
use crate::output;

pub async fn execute(args: &FetchArgs, config: &UpdateConfig, json: bool) -> Result<()> {
    let retriever = FirmwareRetriever::new(file_store(config)?, config.firmware_base_url.clone());
    let hardware = DeviceHardware {
        architecture: args.arch.clone().unwrap_or_default(),
        platformio_target: args.target.clone(),
        supports_unified_ota: args.unified,
        ..Default::default()
    };
    let release = FirmwareRelease::new(args.version.clone(), args.zip_url.clone().unwrap_or_default());
    info!(
        pio_target = %args.target,
        release = %release.id,
        method = ?args.method,
        "Fetching firmware"
    );

    let cancel = cancel_on_interrupt();
    let bar = output::download_bar(json, &format!("firmware for {}", args.target))?;
    let on_progress = |fraction: f32| bar.set_position(output::fraction_to_percent(fraction));

    let retrieved = match args.method {
        Method::Wireless => {
            retriever
                .retrieve_ota_firmware(&release, &hardware, &cancel, &on_progress)
                .await
        }
        Method::MassStorage => {
            retriever
                .retrieve_usb_firmware(&release, &hardware, &cancel, &on_progress)
                .await
        }
        Method::Wifi => {
            retriever
                .retrieve_esp32_firmware(&release, &hardware, &cancel, &on_progress)
                .await
        }
    };
    bar.finish_and_clear();

    let outcome = async {
        let file = retrieved
            .context("Failed to retrieve firmware")?
            .ok_or_else(|| FirmwareUpdateError::AssetNotFound {
                target: args.target.clone(),
            })?;
        let destination = output_path(&args.out, &file);
        let bytes = retriever
            .store()
            .copy(&file, &destination, &cancel)
            .await
            .with_context(|| format!("Failed to write {}", destination.display()))?;
        Ok::<_, anyhow::Error>((destination, bytes))
    }
    .await;
    retriever.store().purge_all().await;

    let (destination, bytes) = outcome?;
    output::print_saved("fetch", &destination, bytes, json)
}
