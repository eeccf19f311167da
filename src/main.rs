mod candidate_extractor;
mod catalog;
mod classifiers;
mod config;
mod document_cache;
mod error;
mod image_pipeline;
mod image_validator;
mod record_assembler;
mod sentence_selector;
mod source_client;

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use log::{error, info, warn};

use crate::config::PipelineConfig;
use crate::document_cache::DocumentCache;
use crate::image_validator::ImageAcceptanceValidator;
use crate::record_assembler::{RecordAssembler, RunOptions};
use crate::source_client::ReferenceSiteClient;

#[derive(Parser, Debug)]
#[command(
    name = "fauna-harvest",
    about = "Enrich the animal seed catalog with descriptive text and validated photos"
)]
struct Cli {
    /// Only process the first N seeds
    #[arg(long)]
    limit: Option<usize>,
    /// Use the placeholder image for every record and download nothing
    #[arg(long)]
    skip_images: bool,
    /// Re-fetch documents and overwrite existing images
    #[arg(long)]
    refresh: bool,
    /// Output dataset path
    #[arg(long)]
    output: Option<PathBuf>,
    /// Directory images are written to
    #[arg(long)]
    image_dir: Option<PathBuf>,
    /// Seed file path
    #[arg(long)]
    seeds: Option<PathBuf>,
    /// Config TOML file
    #[arg(long)]
    config: Option<PathBuf>,
    /// Disable the document cache
    #[arg(long)]
    no_cache: bool,
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn apply_overrides(&self, config: &mut PipelineConfig) {
        if let Some(output) = &self.output {
            config.paths.output = output.clone();
        }
        if let Some(image_dir) = &self.image_dir {
            config.paths.image_dir = image_dir.clone();
        }
        if let Some(seeds) = &self.seeds {
            config.paths.seeds = seeds.clone();
        }
    }
}

fn open_document_cache(config: &PipelineConfig) -> Option<DocumentCache> {
    let path = config
        .paths
        .cache_db
        .clone()
        .or_else(config::default_cache_db_path)?;
    let ttl = Duration::from_secs(config.run.document_cache_ttl_hours.saturating_mul(3600));
    match DocumentCache::open(&path, ttl) {
        Ok(cache) => {
            match cache.prune_expired() {
                Ok(0) => {}
                Ok(pruned) => info!("Pruned {} expired cached documents", pruned),
                Err(err) => warn!("Failed to prune document cache: {}", err),
            }
            info!("Using document cache at {}", path.display());
            Some(cache)
        }
        Err(err) => {
            warn!(
                "Document cache unavailable at {}: {}; continuing without it",
                path.display(),
                err
            );
            None
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut clog = colog::default_builder();
    clog.filter(
        None,
        if cli.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        },
    );
    clog.init();

    std::panic::set_hook(Box::new(|panic_info| {
        let current_thread = std::thread::current();
        let thread_name = current_thread.name().unwrap_or("unnamed");
        log::error!("panic in thread '{}': {}", thread_name, panic_info);
    }));

    let mut config = config::load_config(cli.config.as_deref())?;
    cli.apply_overrides(&mut config);

    let mut seeds = catalog::load_seeds(&config.paths.seeds)?;
    if let Some(limit) = cli.limit {
        seeds.truncate(limit);
    }
    info!(
        "Loaded {} seeds from {}",
        seeds.len(),
        config.paths.seeds.display()
    );

    let cache = if cli.no_cache {
        None
    } else {
        open_document_cache(&config)
    };
    let client = ReferenceSiteClient::new(config.source.clone(), cache, cli.refresh);
    let validator = (!cli.skip_images).then(|| {
        ImageAcceptanceValidator::heuristic(config.validator.clone(), config.keywords.clone())
    });
    let options = RunOptions {
        skip_images: cli.skip_images,
        refresh: cli.refresh,
    };

    let mut assembler = RecordAssembler::new(client, &config, options, validator);
    let records = match assembler.run(&seeds).into_result() {
        Ok(records) => records,
        Err(failure) => {
            error!("{}", failure);
            return Err(failure.into());
        }
    };

    catalog::write_records(&records, &config.paths.output)?;
    info!(
        "Wrote {} records to {}",
        records.len(),
        config.paths.output.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::Cli;
    use crate::config::PipelineConfig;
    use clap::Parser;
    use std::path::PathBuf;

    #[test]
    fn test_cli_flags_override_config_paths() {
        let cli = Cli::parse_from([
            "fauna-harvest",
            "--limit",
            "3",
            "--skip-images",
            "--output",
            "out/animals.json",
            "--image-dir",
            "out/images",
            "-v",
        ]);
        assert_eq!(cli.limit, Some(3));
        assert!(cli.skip_images);
        assert!(cli.verbose);
        assert!(!cli.refresh);

        let mut config = PipelineConfig::default();
        cli.apply_overrides(&mut config);
        assert_eq!(config.paths.output, PathBuf::from("out/animals.json"));
        assert_eq!(config.paths.image_dir, PathBuf::from("out/images"));
        assert_eq!(config.paths.seeds, PathBuf::from("data/animals_source.json"));
    }
}
