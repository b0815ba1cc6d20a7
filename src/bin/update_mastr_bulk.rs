use std::{error::Error, path::Path};

use clap::Parser;
use jiff::Zoned;
use log::{info, warn, LevelFilter};
use mastr::{
    db::{
        mastr::bulk_archive::{LoadReport, TableFilter},
        prod_db::ProdDb,
    },
    soap::client::http_client,
    utils::log_filter,
};
use tabled::{builder::Builder, settings::Style};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Environment name, e.g., test, prod
    #[arg(short, long, default_value = "prod")]
    env: String,

    /// Only load these tables, e.g. einheitenwind,anlageneegwind
    #[arg(long, value_delimiter = ',')]
    include: Vec<String>,

    /// Skip these tables.  Ignored when --include is given.
    #[arg(long, value_delimiter = ',')]
    exclude: Vec<String>,

    /// Load the zip file already on disk, don't download
    #[arg(long, default_value_t = false)]
    no_download: bool,
}

/// Make an ASCII table from the load report
fn ascii_table(report: &LoadReport) -> tabled::Table {
    let mut builder = Builder::new();
    builder.push_record(vec![
        "Member",
        "Table",
        "Mode",
        "Rows",
        "Excised",
        "Added columns",
        "Nulled values",
    ]);
    for m in &report.members {
        builder.push_record(vec![
            m.member.clone(),
            m.table.clone(),
            m.mode.to_string(),
            m.rows.to_string(),
            m.excised.to_string(),
            m.added_columns.join(", "),
            m.nulled_values.len().to_string(),
        ]);
    }
    let mut table = builder.build();
    table.with(Style::empty());
    table
}

/// Run this job once a day, after the Registry publishes the export (around 04:00 CET)
fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    log_filter::init(LevelFilter::Info)?;

    if let Err(e) = dotenvy::from_path(Path::new(format!(".env/{}.env", args.env).as_str())) {
        warn!("no .env/{}.env loaded: {}", args.env, e);
    }

    let today = Zoned::now().date();
    let archive = ProdDb::mastr_bulk();
    let path = archive.filename(&today);
    if !args.no_download {
        let http = http_client()?;
        let url = archive.resolve_url(&http)?;
        if archive.download(&http, &url, &path)? {
            info!("downloaded the export for {}", today);
        }
    }

    let filter = TableFilter {
        include: (!args.include.is_empty()).then_some(args.include),
        exclude: (!args.exclude.is_empty()).then_some(args.exclude),
    };
    let report = archive.update_duckdb(&today, &filter)?;
    info!(
        "loaded {} members into {}, skipped {}",
        report.members.len(),
        archive.duckdb_path,
        report.skipped.len()
    );
    println!("{}", ascii_table(&report));
    Ok(())
}
