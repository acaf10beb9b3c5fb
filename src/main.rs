mod bin_track;
mod cbs;
mod cli;
mod expected_ploidy;
mod genome_regions;
mod globals;
mod hmm;
mod log_utils;
mod logger;
mod numeric_utils;
mod os_utils;
mod partition;
mod partition_output;
mod run_stats;
mod segmentation;
mod special_functions;
mod wavelets;

use std::{error, process};

use hhmmss::Hhmmss;
use log::{error, info};

use crate::globals::{PROGRAM_NAME, PROGRAM_VERSION};
use crate::logger::setup_output_dir_and_logger;
use crate::partition::run_partition;

fn run(settings: &cli::Settings) -> Result<(), Box<dyn error::Error>> {
    info!("Starting {PROGRAM_NAME} {PROGRAM_VERSION}");
    info!(
        "cmdline: {}",
        std::env::args().collect::<Vec<_>>().join(" ")
    );
    info!("Running on {} threads", settings.shared.thread_count);

    let start = std::time::Instant::now();

    run_partition(&settings.shared, &settings.segment)?;

    info!(
        "{PROGRAM_NAME} completed. Total Runtime: {}",
        start.elapsed().hhmmssxxx()
    );
    Ok(())
}

fn main() {
    let settings = cli::validate_and_fix_settings(cli::parse_settings());

    // Setup logger, including creation of the output directory for the log file:
    setup_output_dir_and_logger(
        settings.get_output_dir(),
        settings.shared.clobber,
        settings.shared.debug,
    );

    if let Err(err) = run(&settings) {
        error!("{err}");
        process::exit(2);
    }
}
