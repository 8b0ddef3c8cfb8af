//! CLI entry point for the station feature pipeline.
//!
//! `fit` learns scalers and vocabularies from a training set and writes the
//! matrix plus the fitted state, `transform` reuses a saved state on new
//! trips, and `geohash` exports the station index on its own.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use station_features::fetch::auth::ApiKey;
use station_features::fetch::{BasicClient, DEFAULT_TIMEOUT, HttpClient, read_source};
use station_features::output::{read_fitted, write_index_csv, write_json, write_matrix_csv};
use station_features::parser::{parse_stations, parse_trips, parse_weather};
use station_features::records::{StationRecord, TripTable, WeatherTable};
use station_features::{
    FittedAssembler, PipelineConfig, PreprocessingPipeline, StationGeohashIndex, WeatherSource,
};
use std::ffi::OsStr;
use std::path::Path;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Parser)]
#[command(name = "station-features")]
#[command(about = "Build ridership feature matrices from trips, stations and weather", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Inputs {
    /// Trip CSV (path or URL)
    #[arg(long, value_name = "FILE_OR_URL")]
    trips: String,

    /// Station CSV with name,lat,lon (path or URL)
    #[arg(long, value_name = "FILE_OR_URL")]
    stations: String,

    /// Separate weather CSV joined on the trip timestamp; without it the
    /// weather columns are read from the trip CSV
    #[arg(long, value_name = "FILE_OR_URL")]
    weather: Option<String>,

    #[command(flatten)]
    remote: Remote,
}

/// Options for sources given as URLs.
#[derive(Args)]
struct Remote {
    /// Header name for an API token sent with URL sources (e.g. X-App-Token)
    #[arg(long, requires = "api_key")]
    api_key_header: Option<String>,

    /// API token value
    #[arg(long, requires = "api_key_header")]
    api_key: Option<String>,

    /// Request timeout in seconds
    #[arg(long, default_value_t = DEFAULT_TIMEOUT.as_secs())]
    timeout_secs: u64,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit the assembler on a training set and write the feature matrix
    Fit {
        #[command(flatten)]
        inputs: Inputs,

        /// JSON pipeline config; defaults apply to absent keys
        #[arg(short, long)]
        config: Option<String>,

        /// Feature matrix CSV output
        #[arg(short, long, default_value = "features.csv")]
        matrix: String,

        /// Fitted state JSON output
        #[arg(short, long, default_value = "fitted.json")]
        fitted: String,

        /// Optional JSON run report
        #[arg(long)]
        report: Option<String>,

        /// Gzip the matrix CSV
        #[arg(long, default_value_t = false)]
        gzip: bool,
    },
    /// Transform new trips with a previously fitted state
    Transform {
        #[command(flatten)]
        inputs: Inputs,

        /// Fitted state JSON written by `fit`
        #[arg(short, long)]
        fitted: String,

        /// JSON pipeline config; by default taken from the fitted state
        #[arg(short, long)]
        config: Option<String>,

        /// Feature matrix CSV output
        #[arg(short, long, default_value = "features.csv")]
        matrix: String,

        /// Gzip the matrix CSV
        #[arg(long, default_value_t = false)]
        gzip: bool,
    },
    /// Compute station geohashes and write them as CSV
    Geohash {
        /// Station CSV with name,lat,lon (path or URL)
        #[arg(long, value_name = "FILE_OR_URL")]
        stations: String,

        /// Geohash length (1-12)
        #[arg(short, long, default_value_t = 5)]
        precision: usize,

        /// Output CSV
        #[arg(short, long, default_value = "station_geohash.csv")]
        output: String,

        #[command(flatten)]
        remote: Remote,
    },
}

struct Loaded {
    trips: TripTable,
    stations: Vec<StationRecord>,
    weather: Option<WeatherTable>,
}

impl Loaded {
    fn weather_source(&self) -> WeatherSource<'_> {
        self.weather.as_ref().map_or(WeatherSource::Attached, WeatherSource::Join)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/station_features.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("station_features.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse()?));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse()?));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Fit {
            inputs,
            config,
            matrix,
            fitted,
            report,
            gzip,
        } => {
            let config = match config {
                Some(path) => PipelineConfig::load(&path)?,
                None => PipelineConfig::default(),
            };
            let loaded = load(&inputs, &config).await?;
            let pipeline = PreprocessingPipeline::new(config)?;

            let out = pipeline.run(&loaded.trips, &loaded.stations, loaded.weather_source())?;

            let matrix_path = matrix_path(matrix, gzip);
            write_matrix_csv(&matrix_path, &out.matrix, gzip)?;
            write_json(&fitted, &out.fitted)?;
            if let Some(report) = report {
                write_json(&report, &out.report)?;
            }
            info!(
                matrix = %matrix_path,
                fitted = %fitted,
                rows = out.matrix.n_rows(),
                features = out.matrix.n_cols(),
                "Fit complete"
            );
        }
        Commands::Transform {
            inputs,
            fitted,
            config,
            matrix,
            gzip,
        } => {
            let state = read_fitted(&fitted)?;
            let config = match config {
                Some(path) => PipelineConfig::load(&path)?,
                None => config_from_fitted(&state)?,
            };
            let loaded = load(&inputs, &config).await?;
            let pipeline = PreprocessingPipeline::new(config)?;

            let (features, report) =
                pipeline.transform(&loaded.trips, &loaded.stations, loaded.weather_source(), &state)?;

            let matrix_path = matrix_path(matrix, gzip);
            write_matrix_csv(&matrix_path, &features, gzip)?;
            info!(
                matrix = %matrix_path,
                rows = report.rows,
                unknown_geohash = report.unknown_geohash,
                "Transform complete"
            );
        }
        Commands::Geohash {
            stations,
            precision,
            output,
            remote,
        } => {
            let client = client_for(&remote)?;
            let bytes = read_source(client.as_ref(), &stations).await?;
            let index = StationGeohashIndex::build(&parse_stations(&bytes)?, precision)?;
            write_index_csv(&output, &index)?;
            info!(output = %output, stations = index.len(), precision, "Geohash index written");
        }
    }

    Ok(())
}

fn client_for(remote: &Remote) -> Result<Box<dyn HttpClient>> {
    let basic = BasicClient::with_timeout(Duration::from_secs(remote.timeout_secs))?;
    Ok(match (&remote.api_key_header, &remote.api_key) {
        (Some(header), Some(key)) => Box::new(ApiKey::new(basic, header, key)?),
        _ => Box::new(basic),
    })
}

/// Fetches and parses every input named on the command line.
#[tracing::instrument(skip_all, fields(trips = %inputs.trips, stations = %inputs.stations))]
async fn load(inputs: &Inputs, config: &PipelineConfig) -> Result<Loaded> {
    let client = client_for(&inputs.remote)?;

    let stations = parse_stations(&read_source(client.as_ref(), &inputs.stations).await?)
        .with_context(|| format!("parsing stations from {}", inputs.stations))?;

    let trip_bytes = read_source(client.as_ref(), &inputs.trips).await?;
    let (trips, weather) = match &inputs.weather {
        Some(source) => {
            let weather = parse_weather(&read_source(client.as_ref(), source).await?, &config.weather_columns)
                .with_context(|| format!("parsing weather from {}", source))?;
            (parse_trips(&trip_bytes, &[])?, Some(weather))
        }
        None => (parse_trips(&trip_bytes, &config.weather_columns)?, None),
    };

    info!(
        trips = trips.len(),
        stations = stations.len(),
        weather_rows = weather.as_ref().map(WeatherTable::len),
        "Inputs loaded"
    );
    Ok(Loaded {
        trips,
        stations,
        weather,
    })
}

/// The settings a fitted state pins down; everything else keeps its default.
fn config_from_fitted(fitted: &FittedAssembler) -> Result<PipelineConfig> {
    let time_zone = fitted.time_zone().context("fitted state has no time group")?;
    let geohash_precision = fitted
        .geohash_precision()
        .context("fitted state has no geohash group")?;
    Ok(PipelineConfig {
        geohash_precision,
        time_zone: time_zone.name().to_string(),
        weather_columns: fitted.weather_columns(),
        unknown_category_policy: fitted.unknown_category_policy(),
        ..Default::default()
    })
}

fn matrix_path(path: String, gzip: bool) -> String {
    if gzip && !path.ends_with(".gz") {
        format!("{}.gz", path)
    } else {
        path
    }
}
