//! WSI Service - command line access to Whole Slide Images.
//!
//! This binary wires the local mapper, plugin registry, slide cache,
//! geometry engine and channel projector together and runs one command.

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use thiserror::Error;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wsi_service::{
    config::{Cli, Command, IntensityArgs, RegionArgs, SlideArgs, ThumbnailArgs, TileArgs},
    Background, ChannelProjector, DisplayImage, ExpiringSlideCache, FormatPluginRegistry,
    LocalMapper, PixelBuffer, RasterBackend, RegionGeometryEngine, ServiceError, SlideReader,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.service.verbose);

    if let Err(e) = cli.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    let registry = Arc::new(
        FormatPluginRegistry::builder()
            .register(RasterBackend::new())
            .priority_overrides_from_env()
            .build(),
    );

    let mapper = match LocalMapper::scan(&cli.service.data_dir, &registry) {
        Ok(mapper) => Arc::new(mapper),
        Err(e) => {
            error!("Failed to scan {:?}: {}", cli.service.data_dir, e);
            return ExitCode::FAILURE;
        }
    };
    info!(
        "Found {} slide(s) in {} case(s)",
        mapper.slides().count(),
        mapper.cases().count()
    );

    let app = App {
        cache: ExpiringSlideCache::new(
            registry.clone(),
            mapper.clone(),
            cli.service.cache_config(),
        ),
        engine: RegionGeometryEngine::with_max_region_pixels(Some(cli.service.max_region_pixels)),
        padding_color: cli.service.padding_color.clone(),
        registry,
        mapper,
    };

    let result = app.run(cli.command).await;
    app.cache.close_all().await;

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(CommandError::Service(e)) => {
            error!("{} failed ({:?}): {}", e.phase(), e.class(), e);
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

/// Initialize the tracing/logging subsystem.
fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "wsi_service=debug"
    } else {
        "wsi_service=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[derive(Debug, Error)]
enum CommandError {
    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error("Invalid arguments: {0}")]
    Arguments(String),

    #[error("Failed to write output: {0}")]
    Output(String),
}

struct App {
    registry: Arc<FormatPluginRegistry>,
    mapper: Arc<LocalMapper>,
    cache: ExpiringSlideCache,
    engine: RegionGeometryEngine,
    padding_color: Background,
}

impl App {
    async fn run(&self, command: Command) -> Result<(), CommandError> {
        match command {
            Command::Slides => self.list_slides(),
            Command::Plugins => print_json(&self.registry.plugins_overview()),
            Command::Info(args) => self.info(args).await,
            Command::Region(args) => self.region(args).await,
            Command::Tile(args) => self.tile(args).await,
            Command::Thumbnail(args) => self.thumbnail(args).await,
        }
    }

    fn list_slides(&self) -> Result<(), CommandError> {
        for case in self.mapper.cases() {
            println!("{}  {}", case.case_id, case.local_id);
            for slide_id in &case.slide_ids {
                if let Some(slide) = self.mapper.slide(slide_id) {
                    println!(
                        "  {}  {}  {}",
                        slide.slide_id,
                        slide.local_id,
                        slide.storage.main_address.display()
                    );
                }
            }
        }
        Ok(())
    }

    async fn info(&self, args: SlideArgs) -> Result<(), CommandError> {
        let slide = self.cache.get(&args.slide_id).await.map_err(ServiceError::from)?;
        let info = slide.get_info();
        let tile_grid = (0..info.num_levels())
            .map(|level| {
                info.tile_count(level)
                    .map(|(x, y)| serde_json::json!({ "x": x, "y": y }))
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(ServiceError::from)?;
        print_json(&serde_json::json!({
            "slide_id": slide.slide_id(),
            "plugin": slide.plugin(),
            "info": info,
            "tile_grid": tile_grid,
        }))
    }

    async fn region(&self, args: RegionArgs) -> Result<(), CommandError> {
        let slide = self.cache.get(&args.slide_id).await.map_err(ServiceError::from)?;
        let info = slide.get_info();
        let background = self
            .engine
            .padding_for(&slide, info, args.level, &self.padding_color)
            .await
            .map_err(ServiceError::from)?;
        let buffer = self
            .engine
            .get_region(
                &slide,
                info,
                args.level,
                args.x,
                args.y,
                args.width,
                args.height,
                &background,
            )
            .await
            .map_err(ServiceError::from)?;
        write_png(&buffer, &args.channels, &args.intensity, &args.output)
    }

    async fn tile(&self, args: TileArgs) -> Result<(), CommandError> {
        let slide = self.cache.get(&args.slide_id).await.map_err(ServiceError::from)?;
        let info = slide.get_info();
        let background = self
            .engine
            .padding_for(&slide, info, args.level, &self.padding_color)
            .await
            .map_err(ServiceError::from)?;
        let buffer = self
            .engine
            .get_tile(
                &slide,
                info,
                args.level,
                args.tile_x,
                args.tile_y,
                &background,
            )
            .await
            .map_err(ServiceError::from)?;
        write_png(&buffer, &args.channels, &args.intensity, &args.output)
    }

    async fn thumbnail(&self, args: ThumbnailArgs) -> Result<(), CommandError> {
        let slide = self.cache.get(&args.slide_id).await.map_err(ServiceError::from)?;
        let buffer = slide
            .get_thumbnail(args.max_width, args.max_height)
            .await
            .map_err(ServiceError::from)?;
        write_png(&buffer, &[], &IntensityArgs::default(), &args.output)
    }
}

fn write_png(
    buffer: &PixelBuffer,
    channels: &[usize],
    intensity: &IntensityArgs,
    output: &Path,
) -> Result<(), CommandError> {
    let range = intensity.range().map_err(CommandError::Arguments)?;
    let image: DisplayImage = ChannelProjector::with_range(range)
        .project(buffer, Some(channels))
        .map_err(ServiceError::from)?;

    let (width, height) = (image.width(), image.height());
    image
        .into_dynamic()
        .save_with_format(output, image::ImageFormat::Png)
        .map_err(|e| CommandError::Output(format!("{}: {}", output.display(), e)))?;
    info!("Wrote {}x{} image to {}", width, height, output.display());
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), CommandError> {
    let json =
        serde_json::to_string_pretty(value).map_err(|e| CommandError::Output(e.to_string()))?;
    println!("{}", json);
    Ok(())
}
