#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use ahash::AHashMap;
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use rayon::prelude::*;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use sylvan::blup::ReferencePanel;
use sylvan::config::PredictorConfig;
use sylvan::data::{DataError, PlotRecord, TreeRecord, load_plots, load_trees};
use sylvan::models::{
    ClimatePredictor, DiameterIncrementPredictor, HeightPredictor, MortalityPredictor,
    ThinningPredictor, climate, height, increment, mortality, thinning,
};
use sylvan::params::ParameterStore;
use sylvan::predictor::{
    EventOutcome, EventPredictor, GrowthPredictor, PredictionOptions, PredictorError,
};
use sylvan::types::{Stand, Tree};

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum ModelKind {
    Mortality,
    Increment,
    Thinning,
    Climate,
    Height,
}

impl ModelKind {
    fn parameter_prefix(self) -> &'static str {
        match self {
            Self::Mortality => mortality::PARAMETER_PREFIX,
            Self::Increment => increment::PARAMETER_PREFIX,
            Self::Thinning => thinning::PARAMETER_PREFIX,
            Self::Climate => climate::PARAMETER_PREFIX,
            Self::Height => height::PARAMETER_PREFIX,
        }
    }

    fn is_tree_level(self) -> bool {
        matches!(self, Self::Mortality | Self::Increment | Self::Height)
    }
}

#[derive(Args)]
pub struct PredictArgs {
    /// Model to run
    #[arg(long, value_enum)]
    pub model: ModelKind,

    /// Directory holding the {model}_beta/omega/covparms_{group}.csv files
    #[arg(long, value_name = "DIR")]
    pub parameters: PathBuf,

    /// Plot inventory CSV
    #[arg(long, value_name = "PATH")]
    pub plots: PathBuf,

    /// Tree inventory CSV, required by tree-level models
    #[arg(long, value_name = "PATH")]
    pub trees: Option<PathBuf>,

    /// Reference panel CSV for the climate model
    #[arg(long, value_name = "PATH")]
    pub reference: Option<PathBuf>,

    /// Predictor configuration (TOML)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Exclusion group to predict with instead of the default one
    #[arg(long, value_name = "N")]
    pub group: Option<u32>,

    /// Number of Monte Carlo realizations
    #[arg(long, value_name = "N", default_value_t = 1)]
    pub realizations: u32,

    /// Output TSV
    #[arg(long, default_value = "predictions.tsv")]
    pub output: PathBuf,
}

#[derive(Parser)]
#[command(
    name = "sylvan",
    about = "Mixed-effects growth, mortality and harvest predictors for forest stands",
    long_about = "Predicts tree- and plot-level outcomes from pre-fitted mixed-effects models, \
                 either as expectations or as Monte Carlo realizations."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a predictor over a plot (and tree) inventory
    #[command(about = "Run a predictor (outputs: predictions.tsv)")]
    Predict(PredictArgs),

    /// Display version information
    #[command(about = "Display version information")]
    Version,
}

enum Predictor {
    Event(Box<dyn EventPredictor>),
    Growth(Box<dyn GrowthPredictor>),
}

impl Predictor {
    fn predict(
        &self,
        stand: &dyn Stand,
        tree: Option<&dyn Tree>,
        options: &PredictionOptions,
    ) -> Result<String, PredictorError> {
        match self {
            Self::Event(predictor) => Ok(match predictor.predict_event(stand, tree, options)? {
                EventOutcome::Drawn(occurred) => u8::from(occurred).to_string(),
                EventOutcome::Expected(p) => p.to_string(),
                EventOutcome::OutOfDomain(raw) => {
                    log::warn!(
                        "Probability {raw} out of domain for {}",
                        tree.map_or(stand.subject_id(), |t| t.subject_id())
                    );
                    "NA".to_string()
                }
            }),
            Self::Growth(predictor) => Ok(predictor.predict_growth(stand, tree, options)?.to_string()),
        }
    }
}

struct Row {
    subject_id: String,
    realization: u32,
    prediction: String,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let Cli { command } = Cli::parse();

    let result = match command {
        Some(Commands::Predict(args)) => predict(args),
        Some(Commands::Version) => {
            println!("sylvan {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        None => {
            let _ = Cli::command().print_help();
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

pub fn predict(args: PredictArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = match &args.config {
        Some(path) => PredictorConfig::load(path)?,
        None => PredictorConfig::default(),
    };
    let options = match args.group {
        Some(group) => PredictionOptions::for_group(group),
        None => PredictionOptions::default(),
    };
    let parameters = ParameterStore::load(
        &args.parameters,
        args.model.parameter_prefix(),
        config.default_exclusion_group,
    )?;

    let plots = load_plots(&args.plots)?;
    let trees = match (&args.trees, args.model.is_tree_level()) {
        (Some(path), true) => load_trees(path, &plots)?,
        (None, true) => {
            return Err(format!("--trees is required by the {:?} model", args.model).into());
        }
        (_, false) => Vec::new(),
    };

    let predictor = match args.model {
        ModelKind::Mortality => {
            Predictor::Event(Box::new(MortalityPredictor::new(parameters, config)?))
        }
        ModelKind::Thinning => Predictor::Event(Box::new(ThinningPredictor::new(parameters, config)?)),
        ModelKind::Increment => {
            Predictor::Growth(Box::new(DiameterIncrementPredictor::new(parameters, config)?))
        }
        ModelKind::Climate => {
            let panel = match &args.reference {
                Some(path) => Some(Arc::new(ReferencePanel::from_csv(path)?)),
                None => None,
            };
            let climate = ClimatePredictor::new(parameters, panel, config)?;
            let stands: Vec<&dyn Stand> = plots.iter().map(|p| p as &dyn Stand).collect();
            climate.prepare(&stands)?;
            Predictor::Growth(Box::new(climate))
        }
        ModelKind::Height => {
            let height = HeightPredictor::new(parameters, config)?;
            calibrate_heights(&height, &plots, &trees, &options)?;
            Predictor::Growth(Box::new(height))
        }
    };

    let mut rows = Vec::new();
    for realization in 0..args.realizations {
        let mut plots = plots.clone();
        plots
            .iter_mut()
            .for_each(|p| p.set_monte_carlo_realization_id(realization));
        let by_id: AHashMap<&str, &PlotRecord> =
            plots.iter().map(|p| (p.plot_id.as_str(), p)).collect();

        let predicted: Vec<Row> = if args.model.is_tree_level() {
            let mut trees = trees.clone();
            trees
                .iter_mut()
                .for_each(|t| t.set_monte_carlo_realization_id(realization));
            trees
                .par_iter()
                .map(|tree| -> Result<Row, PredictorError> {
                    let stand = by_id.get(tree.plot_id.as_str()).copied().ok_or_else(|| {
                        DataError::UnknownPlot {
                            tree_id: tree.tree_id.clone(),
                            plot_id: tree.plot_id.clone(),
                        }
                    })?;
                    Ok(Row {
                        subject_id: tree.tree_id.clone(),
                        realization,
                        prediction: predictor.predict(stand, Some(tree), &options)?,
                    })
                })
                .collect::<Result<_, PredictorError>>()?
        } else {
            plots
                .par_iter()
                .map(|plot| -> Result<Row, PredictorError> {
                    Ok(Row {
                        subject_id: plot.plot_id.clone(),
                        realization,
                        prediction: predictor.predict(plot, None, &options)?,
                    })
                })
                .collect::<Result<_, PredictorError>>()?
        };
        rows.extend(predicted);
    }

    write_predictions(&args.output, &rows)?;
    log::info!(
        "Wrote {} predictions for {} realizations to {}",
        rows.len(),
        args.realizations,
        args.output.display()
    );
    Ok(())
}

fn calibrate_heights(
    predictor: &HeightPredictor,
    plots: &[PlotRecord],
    trees: &[TreeRecord],
    options: &PredictionOptions,
) -> Result<(), PredictorError> {
    let mut by_plot: AHashMap<&str, Vec<&dyn Tree>> = AHashMap::new();
    for tree in trees {
        by_plot.entry(tree.plot_id.as_str()).or_default().push(tree);
    }
    let calibrated = plots
        .par_iter()
        .map(|plot| match by_plot.get(plot.plot_id.as_str()) {
            Some(members) => predictor
                .calibrate_plot(plot, members, options)
                .map(|estimate| usize::from(estimate.is_some())),
            None => Ok(0),
        })
        .sum::<Result<usize, PredictorError>>()?;
    log::info!("Calibrated the height model on {calibrated} plots");
    Ok(())
}

fn write_predictions(path: &Path, rows: &[Row]) -> Result<(), std::io::Error> {
    let mut file = BufWriter::new(File::create(path)?);
    writeln!(file, "subject_id\trealization\tprediction")?;
    for row in rows {
        writeln!(file, "{}\t{}\t{}", row.subject_id, row.realization, row.prediction)?;
    }
    file.flush()
}
