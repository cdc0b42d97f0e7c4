//! CLI command for `weirding setup-module`

use anyhow::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::AppContext;
use crate::cli::output::status;
use crate::cli::prompt::{is_interactive, TerminalPrompter};
use crate::core::acquire::AcquireOptions;
use crate::core::catalog::ImageRequest;
use crate::core::device::format_size;
use crate::core::orchestrator::{ProvisionOutcome, ProvisionRequest};
use crate::error::ProvisionError;

/// Options for the setup-module command
#[derive(Debug, Clone)]
pub struct SetupOptions {
    pub os: String,
    pub version: Option<String>,
    pub variant: Option<String>,
    pub name: Option<String>,
    pub reverify: bool,
}

/// Execute the setup-module command
pub async fn execute(ctx: &AppContext, options: SetupOptions) -> Result<()> {
    if !is_interactive() {
        anyhow::bail!(
            "setup-module asks for confirmation before erasing a device \
             and cannot run without a terminal"
        );
    }

    let request = ProvisionRequest {
        image: ImageRequest {
            os_family: options.os,
            version: options.version,
            variant: options.variant,
        },
        module_name: options
            .name
            .unwrap_or_else(|| ctx.config.module_name().to_string()),
        services: ctx.config.services(),
        acquire: AcquireOptions {
            reverify: options.reverify,
        },
    };

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n{} Cancelling after the current chunk...", status::WARNING);
            on_interrupt.cancel();
        }
    });

    let outcome = ctx
        .orchestrator()
        .run(&request, Arc::new(TerminalPrompter::new()), &cancel)
        .await?;

    match outcome {
        ProvisionOutcome::Complete {
            device,
            image,
            write,
            manifest_error,
        } => {
            println!(
                "{} {} is now a module running {} ({} written)",
                status::SUCCESS,
                device.path(),
                image,
                format_size(write.bytes_written)
            );
            if let Some(e) = manifest_error {
                println!("{} {e}", status::WARNING);
                println!("   The device boots, but hosts will not recognise it as a module.");
            }
            Ok(())
        }
        ProvisionOutcome::Cancelled { at, bytes_written } => {
            if bytes_written > 0 {
                println!(
                    "{} Cancelled after {} were written; the device is not bootable. \
                     Run setup-module again to rewrite it.",
                    status::WARNING,
                    format_size(bytes_written)
                );
            } else {
                println!("{} Cancelled; nothing was written.", status::INFO);
            }
            Err(ProvisionError::Cancelled {
                stage: at.to_string(),
            }
            .into())
        }
    }
}
