// ========================================================================================
//
//                      THE COMMAND-LINE DRIVER: MARGINAL
//
// ========================================================================================
//
// A thin shell around the engine: it reads a fitted model (TOML) and, optionally, the
// data it was fitted on (TSV), turns the flags into a term specification, a condition
// and prediction options, and writes the resulting table either to a TSV file or as an
// aligned table to stdout. All statistics live in the library.

use clap::{Parser, Subcommand};
use marginal::{
    CategoricalWeighting, Capability, Condition, FittedModel, PredictOptions, PredictionType,
    TermSpec, Typical, load_frame, predict_marginal,
};
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(
    name = "marginal",
    version,
    about = "Adjusted predictions for fitted (mixed, zero-inflated) regression models",
    long_about = "Computes marginal-effects predictions over a grid of focal-term values \
                  for a fitted model exported as TOML, with confidence or prediction \
                  intervals."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute predictions for one or more focal terms
    #[command(about = "Predict over a grid of focal values (outputs: TSV or table)")]
    Predict {
        /// Path to the fitted model (.toml)
        #[arg(long)]
        model: PathBuf,

        /// TSV file with the data the model was fitted on; replaces the model's
        /// stored variable summaries for every column it contains
        #[arg(long)]
        frame: Option<PathBuf>,

        /// Columns of --frame to read as categorical even when they look numeric
        #[arg(long = "categorical-column", value_name = "COLUMN")]
        categorical_columns: Vec<String>,

        /// Focal term, e.g. "x", "group [A,B]" or "dose [0:10 by=2]"; repeat in order
        #[arg(long = "terms", value_name = "TERM", required = true)]
        terms: Vec<String>,

        /// fixed, random, zero_inflated, zi_random or sim
        #[arg(long = "type", default_value = "fixed")]
        prediction_type: PredictionType,

        /// Pin a non-focal variable, e.g. --condition temp=20
        #[arg(long, value_name = "NAME=VALUE", value_parser = Condition::parse_assignment)]
        condition: Vec<(String, marginal::Value)>,

        /// Monte-Carlo draws for the simulated types
        #[arg(long, default_value_t = marginal::predict::DEFAULT_DRAWS)]
        draws: usize,

        /// Interval level
        #[arg(long, default_value_t = marginal::predict::DEFAULT_CI_LEVEL)]
        ci_level: f64,

        /// Seed for sampling and simulation
        #[arg(long)]
        seed: Option<u64>,

        /// Representative value of non-focal numeric covariates: mean or median
        #[arg(long, default_value = "mean")]
        typical: Typical,

        /// Non-focal categorical covariates: reference or proportional
        #[arg(long = "categorical", default_value = "reference")]
        categorical: CategoricalWeighting,

        /// Average the back-transformed prediction over the random-effect distribution
        #[arg(long)]
        bias_correction: bool,

        /// Write a TSV file instead of printing a table
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Summarize a fitted model file
    #[command(about = "Print the family, links, capabilities and variables of a model")]
    Describe {
        /// Path to the fitted model (.toml)
        #[arg(long)]
        model: PathBuf,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Predict {
            model,
            frame,
            categorical_columns,
            terms,
            prediction_type,
            condition,
            draws,
            ci_level,
            seed,
            typical,
            categorical,
            bias_correction,
            out,
        } => {
            let options = PredictOptions {
                ci_level,
                draws,
                seed,
                typical,
                categorical,
                bias_correction,
            };
            predict_command(
                &model,
                frame.as_deref(),
                &categorical_columns,
                &terms,
                prediction_type,
                condition,
                &options,
                out.as_deref(),
            )
        }
        Commands::Describe { model } => describe_command(&model),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

#[allow(clippy::too_many_arguments)]
fn predict_command(
    model_path: &std::path::Path,
    frame_path: Option<&std::path::Path>,
    categorical_columns: &[String],
    terms: &[String],
    prediction_type: PredictionType,
    assignments: Vec<(String, marginal::Value)>,
    options: &PredictOptions,
    out: Option<&std::path::Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut model = FittedModel::load(model_path)?;
    log::info!("Loaded {} model from {}", model.family, model_path.display());

    if let Some(path) = frame_path {
        let frame = load_frame(path, categorical_columns)?;
        model.frame.merge(frame)?;
        model.validate()?;
    }

    let terms = TermSpec::parse(terms)?;
    let mut condition = Condition::new();
    for (name, value) in assignments {
        condition.insert(name, value);
    }

    if prediction_type.is_simulated() && options.seed.is_none() {
        log::info!("No --seed given; simulated intervals will differ between runs");
    }

    let result = predict_marginal(&model, &terms, prediction_type, &condition, options)?;

    match out {
        Some(path) => {
            result.save_tsv(path)?;
            println!("Predictions saved to: {}", path.display());
        }
        None => print!("{result}"),
    }
    Ok(())
}

fn describe_command(model_path: &std::path::Path) -> Result<(), Box<dyn std::error::Error>> {
    let model = FittedModel::load(model_path)?;

    println!("Family:          {}", model.family);
    let link = model.conditional.link;
    if link == model.family.canonical_link() {
        println!("Link:            {link} (canonical)");
    } else {
        println!("Link:            {link}");
    }
    println!(
        "Coefficients:    {} (conditional)",
        model.conditional.coefficients.len()
    );
    if let Some(zi) = &model.zero_inflation {
        println!("Zero-inflation:  {} coefficients, {} link", zi.coefficients.len(), zi.link);
    }
    for capability in [
        Capability::RandomEffects,
        Capability::ZeroInflation,
        Capability::Dispersion,
    ] {
        let status = if model.has(capability) { "yes" } else { "no" };
        println!("Has {:<26} {}", format!("{capability}:"), status);
    }
    if let Some(re) = &model.random_effects {
        for factor in re.factors() {
            println!(
                "Grouping factor: {} ({} levels, {} random effects)",
                factor.name,
                factor.levels.len(),
                factor.dim()
            );
        }
    }
    println!("Variables:");
    for (name, variable) in model.frame.iter() {
        match variable.levels() {
            Some(levels) => println!("  {name}: categorical [{}]", levels.join(", ")),
            None => println!("  {name}: numeric"),
        }
    }
    Ok(())
}
