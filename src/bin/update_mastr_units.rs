use std::{error::Error, path::Path, sync::Arc};

use clap::Parser;
use log::{error, info, warn, LevelFilter};
use mastr::{
    carrier::{Carrier, Linked},
    config::{CredentialStore, Settings},
    db::{
        mastr::{
            catalog::{build_catalog, ids, CatalogOutcome},
            materialize::materialize,
            unit_archive::FailTarget,
        },
        prod_db::ProdDb,
    },
    ingest::{
        blacklist::Blacklist,
        driver::{DownloadOptions, Driver, Mode, Outcome, RunReport},
        sink::{CsvSink, FailSink, FlatTable},
    },
    soap::{
        client::session,
        fetcher::{FetchKind, SoapFetcher},
        power_units::{download_power_units, MAX_CHUNK},
        quota::{read_quota, Quota},
    },
    utils::log_filter,
};
use tabled::{builder::Builder, settings::Style};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Environment name, e.g., test, prod
    #[arg(short, long, default_value = "prod")]
    env: String,

    /// Energy carrier, one of wind, solar, biomass, hydro, nuclear, combustion, gas, storage, gsgk
    #[arg(short, long)]
    carrier: Carrier,

    /// Number of worker threads, 1 runs serially.  Defaults to MASTR_THREADS.
    #[arg(short, long)]
    threads: Option<usize>,

    /// Only run the third attempt for the ids in the fail files
    #[arg(long, default_value_t = false)]
    retry: bool,

    /// Refresh the master unit list first, with up to this many entries
    #[arg(long)]
    power_units: Option<u64>,

    /// Fetch even inside the blacklist windows
    #[arg(long, default_value_t = false)]
    ignore_blacklist: bool,
}

struct Job {
    name: String,
    ids: Vec<String>,
    kind: FetchKind,
    sink: CsvSink,
    fail_sink: FailSink,
    key_column: &'static str,
}

/// Make an ASCII table from the run reports
fn ascii_table(reports: &[(String, RunReport)]) -> tabled::Table {
    let mut builder = Builder::new();
    builder.push_record(vec![
        "Job",
        "Fetched",
        "Second fails",
        "Third fails",
        "Calls",
        "Outcome",
    ]);
    for (name, report) in reports {
        builder.push_record(vec![
            name.clone(),
            report.fetched.to_string(),
            report.second_fails.to_string(),
            report.third_fails.to_string(),
            report.calls.to_string(),
            format!("{:?}", report.outcome),
        ]);
    }
    let mut table = builder.build();
    table.with(Style::empty());
    table
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    log_filter::init(LevelFilter::Info)?;

    if let Err(e) = dotenvy::from_path(Path::new(format!(".env/{}.env", args.env).as_str())) {
        warn!("no .env/{}.env loaded: {}", args.env, e);
    }
    let settings = Settings::from_env();
    let archive = ProdDb::mastr_units();
    let carrier = args.carrier;

    let credentials = match CredentialStore::default_location().load() {
        Ok(c) => c,
        Err(e) => {
            error!("{}", e);
            return Err(e.into());
        }
    };
    let (client, api, token, operator_id) = session(&settings, credentials)?;
    let quota = match read_quota(&client, &operator_id, &token) {
        Ok(q) => Some(q),
        Err(e) => {
            warn!("could not read the daily quota: {}", e);
            None
        }
    };

    if let Some(limit) = args.power_units {
        let sink = CsvSink::new(archive.power_unit_file());
        download_power_units(&api, &sink, &settings.data_version, limit, MAX_CHUNK)?;
    }

    let catalog_path = archive.catalog_file(carrier);
    match build_catalog(
        &archive.power_unit_file(),
        carrier,
        &catalog_path,
        &settings.data_version,
    )? {
        CatalogOutcome::MissingInput => {
            error!("no master unit list, skipping {}", carrier);
            return Ok(());
        }
        CatalogOutcome::Built(n) => info!("{} catalog has {} units", carrier, n),
        CatalogOutcome::Skipped => {}
    }
    let catalog = FlatTable::read(&catalog_path)?;

    let mut jobs = vec![Job {
        name: format!("{} units", carrier),
        ids: ids(&catalog, "EinheitMastrNummer"),
        kind: FetchKind::Unit(carrier),
        sink: CsvSink::new(archive.unit_file(carrier)),
        fail_sink: FailSink::new(archive.fail_file(carrier, FailTarget::Unit)),
        key_column: "EinheitMastrNummer",
    }];
    if let Some(linked) = carrier.linked() {
        jobs.push(Job {
            name: format!("{} {}", carrier, linked.role()),
            ids: ids(&catalog, linked.key_column()),
            kind: match linked {
                Linked::Eeg => FetchKind::Subsidy(carrier),
                Linked::Kwk => FetchKind::Chp,
            },
            sink: CsvSink::new(archive.linked_file(carrier, linked)),
            fail_sink: FailSink::new(archive.fail_file(carrier, FailTarget::Linked)),
            key_column: linked.key_column(),
        });
    }
    jobs.push(Job {
        name: format!("{} permits", carrier),
        ids: ids(&catalog, "GenMastrNummer"),
        kind: FetchKind::Permit,
        sink: CsvSink::new(archive.permit_file(carrier)),
        fail_sink: FailSink::new(archive.fail_file(carrier, FailTarget::Permit)),
        key_column: "GenMastrNummer",
    });

    let blacklist = if args.ignore_blacklist {
        None
    } else {
        Some(Blacklist::parse(settings.blacklist.as_slice())?)
    };
    let threads = args.threads.unwrap_or(settings.threads);
    let mut options = DownloadOptions {
        mode: if threads > 1 {
            Mode::Parallel(threads)
        } else {
            Mode::Serial
        },
        liveness_timeout: settings.liveness_timeout,
        blacklist,
        quota,
    };

    let mut reports: Vec<(String, RunReport)> = Vec::new();
    for job in jobs {
        let fetcher = Arc::new(SoapFetcher::new(api.clone(), job.kind, &settings.data_version));
        let driver = Driver::new(options.clone());
        let report = if args.retry {
            driver.retry(fetcher, &job.sink, &job.fail_sink, job.key_column)?
        } else {
            driver.download(&job.ids, fetcher, &job.sink, &job.fail_sink)?
        };
        // the next job only gets what is left of today's quota
        options.quota = options.quota.map(|q| Quota {
            used: q.used + report.calls,
            ..q
        });
        let outcome = report.outcome;
        reports.push((job.name, report));
        match outcome {
            Outcome::Completed => {}
            Outcome::Blacklisted | Outcome::QuotaExhausted => {
                info!("stopped early ({:?}), run again later to resume", outcome);
                println!("{}", ascii_table(&reports));
                return Ok(());
            }
        }
    }

    let rows = materialize(&archive, carrier)?;
    info!("{} joined rows for {}", rows, carrier);
    println!("{}", ascii_table(&reports));
    Ok(())
}
