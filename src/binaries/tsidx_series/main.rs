use clap::Parser;
use serde::Deserialize;
use serde::Serialize;
use tsidx_index::series::series_key::format_series_key;
use tsidx_index::series::SeriesFile;

/// Lists the live series in a series file directory, ordered by key.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Parser)]
#[clap(about, version, author)]
struct Config {
    /// Path to the `_series` directory.
    #[clap(long)]
    pub path: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    println!("config: {:?}", config);
    if config.path.is_empty() {
        println!("path MUST not be empty!");
        return Ok(());
    }

    let sfile = SeriesFile::open(config.path.as_str()).await?;
    println!(
        "{} live series, {} tombstoned",
        sfile.series_count()?,
        sfile.tombstone_series_id_set()?.len()
    );

    let ids = sfile.series_ids()?;
    for (i, id) in ids.iter().enumerate() {
        let key = sfile.series_key(*id)?;
        println!("{}>{} id={}", i, format_series_key(&key)?, id);
    }

    Ok(())
}
