//! Documentation for the binary is with the definition of `ShowClustersOptionsInit` below.

use clap::Parser;
use geovisit::{ClusterId, ClusterStore, GeoVisitResult, TerminalId, VisitDatabase};
use rustc_hash::FxHashMap as HashMap;
use std::{
    fmt::{self, Display},
    path::PathBuf,
};

/*-------------------------------------------------------------------------------------------------
 *                               Parse Command Line Arguments
 *-----------------------------------------------------------------------------------------------*/
///
/// Show the visit clusters of a terminal.
///
/// Clusters are listed with the most visited first, along with how many positions were
/// associated with each one.
///
#[derive(Debug, Parser)]
#[clap(bin_name = "showclusters")]
#[clap(author, version, about)]
struct ShowClustersOptionsInit {
    /// The path to the visit database file.
    ///
    /// If this is not specified, then the program will check for it in the "VISIT_DB"
    /// environment variable.
    #[clap(short = 'd', long)]
    #[clap(env = "VISIT_DB")]
    visit_store_file: PathBuf,

    /// The terminal to show.
    terminal: TerminalId,

    /// Only show this many clusters.
    #[clap(short, long)]
    limit: Option<usize>,

    /// Verbose output
    #[clap(short, long)]
    verbose: bool,
}

#[derive(Debug)]
struct ShowClustersOptionsChecked {
    visit_store_file: PathBuf,
    terminal: TerminalId,
    limit: usize,
    verbose: bool,
}

impl Display for ShowClustersOptionsChecked {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        writeln!(f, "\n")?; // yes, two blank lines.
        writeln!(f, "Database: {}", self.visit_store_file.display())?;
        writeln!(f, "Terminal: {}", self.terminal)?;
        writeln!(f, "   Limit: {}", self.limit)?;
        writeln!(f, "\n")?; // yes, two blank lines.

        Ok(())
    }
}

fn parse_args() -> GeoVisitResult<ShowClustersOptionsChecked> {
    let ShowClustersOptionsInit {
        visit_store_file,
        terminal,
        limit,
        verbose,
    } = ShowClustersOptionsInit::parse();

    if !visit_store_file.exists() {
        return Err(format!("no database at {}", visit_store_file.display()).into());
    }

    Ok(ShowClustersOptionsChecked {
        visit_store_file,
        terminal,
        limit: limit.unwrap_or(usize::MAX),
        verbose,
    })
}

/*-------------------------------------------------------------------------------------------------
 *                                            Main
 *-----------------------------------------------------------------------------------------------*/
fn main() -> GeoVisitResult<()> {
    let opts = parse_args()?;

    if opts.verbose {
        println!("{}", opts);
    }

    let mut db = VisitDatabase::connect(&opts.visit_store_file)?;

    let mut clusters = db.clusters_for_terminal(opts.terminal)?;
    clusters.sort_by(|a, b| {
        b.visit_count()
            .cmp(&a.visit_count())
            .then(a.id().cmp(&b.id()))
    });

    let accepted = count_by_cluster(&db, opts.terminal, true)?;
    let rejected = count_by_cluster(&db, opts.terminal, false)?;

    println!(
        "{:>9} {:>11} {:>12} {:>6} {:>8} {:>8}  {}",
        "Cluster", "Lat", "Lon", "Visits", "Accepted", "Rejected", "Last Visited At"
    );
    for cluster in clusters.iter().take(opts.limit) {
        let anchor = cluster.anchor();
        println!(
            "{:>9} {:>11.6} {:>12.6} {:>6} {:>8} {:>8}  {}",
            cluster.id(),
            anchor.lat,
            anchor.lon,
            cluster.visit_count(),
            accepted.get(&cluster.id()).copied().unwrap_or(0),
            rejected.get(&cluster.id()).copied().unwrap_or(0),
            cluster.last_visited_at()
        );
    }

    if opts.verbose {
        let total_visits: u32 = clusters.iter().map(|c| c.visit_count()).sum();
        println!();
        println!("  Clusters: {:>9}", clusters.len());
        println!("    Visits: {:>9}", total_visits);
        println!(" Positions: {:>9}", accepted.values().sum::<usize>());
    }

    Ok(())
}

fn count_by_cluster(
    db: &VisitDatabase,
    terminal: TerminalId,
    accepted: bool,
) -> GeoVisitResult<HashMap<ClusterId, usize>> {
    let mut counts = HashMap::default();
    for assoc in db.associations_for_terminal(terminal, accepted)? {
        *counts.entry(assoc.cluster_id).or_insert(0) += 1;
    }

    Ok(counts)
}
