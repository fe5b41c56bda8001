use clap::Parser;
use serde::Deserialize;
use serde::Serialize;
use tsidx_common::iterator::TryIterator;
use tsidx_index::file_set::File;
use tsidx_index::index_file::IndexFile;

/// Dumps the contents of one index (.tsi) file: measurements, tag keys,
/// tag values and posting cardinalities.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Parser)]
#[clap(about, version, author)]
struct Config {
    /// Path to a .tsi file.
    #[clap(long)]
    pub path: String,
    /// Also print the series IDs of every posting set.
    #[clap(long)]
    pub postings: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    println!("config: {:?}", config);
    if config.path.is_empty() {
        println!("path MUST not be empty!");
        return Ok(());
    }

    let file = IndexFile::open(config.path.as_str(), 0).await?;
    println!(
        "{} bytes, {} series, {} tombstones",
        file.size(),
        file.series_id_set()?.len(),
        file.tombstone_series_id_set()?.len()
    );

    let mut measurements = file.measurement_iterator()?;
    while let Some(m) = measurements.try_next()? {
        let name = String::from_utf8_lossy(&m.name).to_string();
        let ids = match file.measurement_series_ids(&m.name)? {
            Some(postings) => postings.ids,
            None => continue,
        };
        let marker = if m.deleted { " (deleted)" } else { "" };
        println!("{}{} series={}", name, marker, ids.len());
        if config.postings {
            println!("  ids: {:?}", ids.iter().collect::<Vec<_>>());
        }

        let mut keys = match file.tag_key_iterator(&m.name)? {
            Some(keys) => keys,
            None => continue,
        };
        while let Some(k) = keys.try_next()? {
            let key = String::from_utf8_lossy(&k.key).to_string();
            let marker = if k.deleted { " (deleted)" } else { "" };
            println!("  {}{}", key, marker);

            let mut values = match file.tag_value_iterator(&m.name, &k.key)? {
                Some(values) => values,
                None => continue,
            };
            while let Some(v) = values.try_next()? {
                let ids = file
                    .tag_value_series_ids(&m.name, &k.key, &v.value)?
                    .map(|p| p.ids)
                    .unwrap_or_default();
                let marker = if v.deleted { " (deleted)" } else { "" };
                println!(
                    "    {}{} series={}",
                    String::from_utf8_lossy(&v.value),
                    marker,
                    ids.len()
                );
                if config.postings {
                    println!("      ids: {:?}", ids.iter().collect::<Vec<_>>());
                }
            }
        }
    }

    Ok(())
}
