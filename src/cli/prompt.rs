//! Terminal implementation of the provisioning callbacks
//!
//! Device selection and the two confirmations are read from stdin. The final
//! confirmation requires typing the device path so a wrong selection is
//! caught before anything is overwritten.

use indicatif::ProgressBar;
use std::io::{self, BufRead, IsTerminal, Write};
use std::sync::Mutex;

use crate::cli::output::{create_download_bar, create_write_bar, status};
use crate::core::device::{format_size, DeviceRecord};
use crate::core::orchestrator::{
    ConfirmationPrompt, ConfirmationStage, ProvisionCallbacks, ProvisionState,
};

/// Whether prompts can be answered
pub fn is_interactive() -> bool {
    io::stdin().is_terminal()
}

/// Prompts on stderr, answers from stdin, progress with indicatif
#[derive(Default)]
pub struct TerminalPrompter {
    download: Mutex<Option<ProgressBar>>,
    write: Mutex<Option<ProgressBar>>,
}

impl TerminalPrompter {
    pub fn new() -> Self {
        Self::default()
    }

    fn ask(question: &str) -> Option<String> {
        eprint!("{question}");
        io::stderr().flush().ok()?;
        let mut line = String::new();
        match io::stdin().lock().read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line.trim().to_string()),
        }
    }

    fn update_bar(
        slot: &Mutex<Option<ProgressBar>>,
        make: fn(u64) -> ProgressBar,
        done: u64,
        total: u64,
    ) {
        let Ok(mut slot) = slot.lock() else { return };
        let bar = slot.get_or_insert_with(|| make(total));
        bar.set_position(done);
        if total > 0 && done >= total {
            bar.finish();
        }
    }

    fn finish_bar(slot: &Mutex<Option<ProgressBar>>) {
        if let Ok(mut slot) = slot.lock() {
            if let Some(bar) = slot.take() {
                bar.abandon();
            }
        }
    }
}

/// Parse a 1-based menu choice
fn parse_choice(answer: &str, count: usize) -> Option<usize> {
    answer
        .parse::<usize>()
        .ok()
        .filter(|n| (1..=count).contains(n))
        .map(|n| n - 1)
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.to_ascii_lowercase().as_str(), "y" | "yes")
}

impl ProvisionCallbacks for TerminalPrompter {
    fn select_device(&self, candidates: &[DeviceRecord]) -> Option<DeviceRecord> {
        if !is_interactive() {
            return None;
        }
        eprintln!("\nSuitable devices:");
        for (i, device) in candidates.iter().enumerate() {
            eprintln!(
                "  {}) {:<14} {:>10}  {:<6} {}",
                i + 1,
                device.path(),
                format_size(device.size_bytes()),
                device.bus(),
                device.label()
            );
        }
        loop {
            let question = format!("Select a device [1-{}, q to quit]: ", candidates.len());
            let answer = Self::ask(&question)?;
            if answer.eq_ignore_ascii_case("q") {
                return None;
            }
            match parse_choice(&answer, candidates.len()) {
                Some(index) => return candidates.get(index).cloned(),
                None => eprintln!(
                    "{} '{answer}' is not one of the listed devices",
                    status::WARNING
                ),
            }
        }
    }

    fn confirm(&self, prompt: &ConfirmationPrompt<'_>) -> bool {
        if !is_interactive() {
            return false;
        }
        let device = prompt.device;
        match prompt.stage {
            ConfirmationStage::DeviceSelected => {
                eprintln!(
                    "\n{} {} ({}, {}, {})",
                    status::INFO,
                    device.path(),
                    format_size(device.size_bytes()),
                    device.bus(),
                    device.label()
                );
                eprintln!("   Image: {} ({})", prompt.image.name, prompt.image);
                Self::ask("Use this device? [y/N] ").is_some_and(|a| is_yes(&a))
            }
            ConfirmationStage::FinalWrite => {
                eprintln!();
                eprintln!(
                    "{} ALL DATA ON {} ({}) WILL BE DESTROYED.",
                    status::WARNING,
                    device.path(),
                    format_size(device.size_bytes())
                );
                Self::ask(&format!("Type {} to start writing: ", device.path()))
                    .is_some_and(|a| a == device.path())
            }
        }
    }

    fn on_write_progress(&self, bytes_written: u64, total_bytes: u64) {
        Self::update_bar(&self.write, create_write_bar, bytes_written, total_bytes);
    }

    fn on_state(&self, state: ProvisionState) {
        match state {
            ProvisionState::Acquiring => {
                eprintln!("{} Waiting for the image download", status::INFO)
            }
            ProvisionState::Verifying => eprintln!("{} Write verified", status::SUCCESS),
            ProvisionState::InjectingManifest => {
                eprintln!("{} Writing module manifest", status::INFO)
            }
            ProvisionState::Cancelled | ProvisionState::Failed => {
                Self::finish_bar(&self.download);
                Self::finish_bar(&self.write);
            }
            _ => {}
        }
    }

    fn on_download(&self, downloaded: u64, total: u64) {
        Self::update_bar(&self.download, create_download_bar, downloaded, total);
    }
}
