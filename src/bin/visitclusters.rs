//! Documentation for the binary is with the definition of `VisitClustersOptionsInit` below.

use clap::Parser;
use geovisit::{
    AssociationConfig, AssociationKind, BatchDriver, BatchOptions, GeoVisitResult, VisitDatabase,
    DEFAULT_SPATIAL_THRESHOLD_METERS, DEFAULT_TEMPORAL_THRESHOLD_MINUTES,
};
use log::{debug, info, warn, LevelFilter};
use simple_logger::SimpleLogger;
use std::{
    fmt::{self, Display},
    path::PathBuf,
    sync::atomic::Ordering,
};
use strum::IntoEnumIterator;

/*-------------------------------------------------------------------------------------------------
 *                               Parse Command Line Arguments
 *-----------------------------------------------------------------------------------------------*/
///
/// Fold pending geoposition pings into visit clusters.
///
/// This program is meant to be run on a schedule. Every run picks up all the terminals with
/// positions that haven't been processed yet and clusters them, so it is safe to stop it at any
/// time and run it again later.
///
#[derive(Debug, Parser)]
#[clap(bin_name = "visitclusters")]
#[clap(author, version, about)]
struct VisitClustersOptionsInit {
    /// The path to the visit database file.
    ///
    /// If this is not specified, then the program will check for it in the "VISIT_DB"
    /// environment variable.
    #[clap(short = 'd', long)]
    #[clap(env = "VISIT_DB")]
    visit_store_file: PathBuf,

    /// Pings within this many meters of a cluster anchor belong to that cluster.
    #[clap(short, long)]
    #[clap(default_value_t = DEFAULT_SPATIAL_THRESHOLD_METERS)]
    spatial_threshold: f64,

    /// Pings more than this many minutes after the last visit to a cluster start a new visit.
    #[clap(short, long)]
    #[clap(default_value_t = DEFAULT_TEMPORAL_THRESHOLD_MINUTES)]
    temporal_threshold: i64,

    /// The maximum number of positions to process for a terminal in one transaction batch.
    #[clap(short, long)]
    #[clap(default_value_t = 500)]
    batch_size: usize,

    /// Number of worker threads, defaults to the number of CPUs.
    #[clap(short, long)]
    workers: Option<usize>,

    /// Stop cleanly after this many seconds, leaving the rest for the next run.
    #[clap(long)]
    time_limit: Option<u64>,

    /// Verbose output
    #[clap(short, long)]
    verbose: bool,
}

#[derive(Debug)]
struct VisitClustersOptionsChecked {
    /// The path to the database file.
    visit_store_file: PathBuf,

    /// Options handed to the batch driver.
    batch: BatchOptions,

    /// Stop after this long.
    time_limit: Option<std::time::Duration>,

    /// Verbose output
    verbose: bool,
}

impl Display for VisitClustersOptionsChecked {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        writeln!(f, "\n")?; // yes, two blank lines.
        writeln!(f, "          Database: {}", self.visit_store_file.display())?;
        writeln!(
            f,
            " Spatial Threshold: {:.1} m",
            self.batch.config.spatial_threshold_meters
        )?;
        writeln!(
            f,
            "Temporal Threshold: {} min",
            self.batch.config.temporal_threshold.num_minutes()
        )?;
        writeln!(f, "        Batch Size: {}", self.batch.batch_size)?;
        writeln!(f, "           Workers: {}", self.batch.workers)?;
        match self.time_limit {
            Some(limit) => writeln!(f, "        Time Limit: {} s", limit.as_secs())?,
            None => writeln!(f, "        Time Limit: none")?,
        }
        writeln!(f, "\n")?; // yes, two blank lines.

        Ok(())
    }
}

/// Get the command line arguments and check them.
///
/// If there is missing data, try to fill it in with environment variables.
fn parse_args() -> GeoVisitResult<VisitClustersOptionsChecked> {
    let VisitClustersOptionsInit {
        visit_store_file,
        spatial_threshold,
        temporal_threshold,
        batch_size,
        workers,
        time_limit,
        verbose,
    } = VisitClustersOptionsInit::parse();

    let config = AssociationConfig::from_minutes(spatial_threshold, temporal_threshold)?;

    if batch_size == 0 {
        return Err("batch size must be at least 1".into());
    }

    let workers = match workers {
        Some(0) => return Err("need at least 1 worker".into()),
        Some(n) => n,
        None => num_cpus::get(),
    };

    Ok(VisitClustersOptionsChecked {
        visit_store_file,
        batch: BatchOptions {
            config,
            batch_size,
            workers,
        },
        time_limit: time_limit.map(std::time::Duration::from_secs),
        verbose,
    })
}

/*-------------------------------------------------------------------------------------------------
 *                                            Main
 *-----------------------------------------------------------------------------------------------*/
fn main() -> GeoVisitResult<()> {
    let opts = parse_args()?;

    let level = if opts.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    SimpleLogger::new().with_level(level).init()?;

    if opts.verbose {
        info!(target: "startup", "{}", opts);
        debug!(target: "startup", "Debug logging active.");
    }

    VisitDatabase::initialize(&opts.visit_store_file)?;

    let store_file = opts.visit_store_file.clone();
    let driver = BatchDriver::new(move || VisitDatabase::connect(&store_file), opts.batch);

    if let Some(limit) = opts.time_limit {
        let cancel = driver.cancel_flag();
        std::thread::Builder::new()
            .name("geovisit-timer".to_owned())
            .spawn(move || {
                std::thread::sleep(limit);
                warn!(target: "startup", "Time limit reached, stopping.");
                cancel.store(true, Ordering::Release);
            })?;
    }

    let summary = driver.run()?;

    info!(target: "summary", "");
    info!(target: "summary", "Run summary:");
    for line in summary.to_string().lines() {
        info!(target: "summary", "{}", line);
    }

    if opts.verbose {
        for kind in AssociationKind::iter() {
            info!(target: "summary", "{:>12} - {:>9}", Into::<&'static str>::into(kind),
                summary.totals.count_of(kind));
        }
    }

    if summary.failed > 0 {
        warn!(target: "summary", "{} terminals failed and will be retried next run.", summary.failed);
    }

    Ok(())
}
