use clap::{Parser, Subcommand};
use ndarray::{Array1, Array2};
use polars::prelude::*;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process;

use storecast::data::{self, load_raw_table};
use storecast::model::{
    BoostParams, ModelBundle, Regressor, r_squared, rmse, train_gradient_boost, train_linear,
};
use storecast::preprocess::preprocess_table;
use storecast::registry::{self, ModelRegistry, predict_rows};
use storecast::scale::{apply_scaler, fit_scaler};
use storecast::schema;

/// Identifiers the registry serves; one artifact file per model.
const LINEAR_MODEL_ID: &str = "linear_regression";
const BOOST_MODEL_ID: &str = "gradient_boost";

#[derive(Parser)]
#[command(
    name = "storecast",
    about = "Train and serve weekly-sales forecasting models",
    long_about = "A feature-alignment engine for retail weekly-sales forecasting. \
                  Training persists each model together with its training-time feature \
                  names; prediction reconciles arbitrary input tables against them."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train both model kinds from a raw sales CSV
    #[command(about = "Train models (outputs: <models-dir>/*.toml)")]
    Train {
        /// Path to the raw sales CSV (Store, Date, Weekly_Sales, ...)
        training_data: PathBuf,

        /// Directory the model artifacts and scaler state are written to
        #[arg(long, default_value = "models")]
        models_dir: PathBuf,

        /// Fraction of rows held out for evaluation
        #[arg(long, default_value = "0.2")]
        holdout: f64,

        /// Boosting rounds for the gradient-boost model
        #[arg(long, default_value = "100")]
        boost_rounds: usize,

        /// Shrinkage applied to each boosting round
        #[arg(long, default_value = "0.1")]
        learning_rate: f64,
    },

    /// Predict weekly sales for a raw input CSV
    #[command(about = "Apply a trained model to new data (outputs: predictions TSV)")]
    Predict {
        /// Path to the input CSV; a Weekly_Sales column is not required
        input_data: PathBuf,

        /// Directory holding the trained model artifacts
        #[arg(long, default_value = "models")]
        models_dir: PathBuf,

        /// Which model to serve
        #[arg(long, default_value = LINEAR_MODEL_ID)]
        model: String,

        /// Where to write predictions; stdout when omitted
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Train {
            training_data,
            models_dir,
            holdout,
            boost_rounds,
            learning_rate,
        } => train_command(
            &training_data,
            &models_dir,
            holdout,
            boost_rounds,
            learning_rate,
        ),
        Commands::Predict {
            input_data,
            models_dir,
            model,
            out,
        } => predict_command(&input_data, &models_dir, &model, out.as_deref()),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn train_command(
    training_data: &Path,
    models_dir: &Path,
    holdout: f64,
    boost_rounds: usize,
    learning_rate: f64,
) -> Result<(), Box<dyn std::error::Error>> {
    let raw = load_raw_table(training_data)?;
    let processed = preprocess_table(raw)?;

    let names = data::column_names(&processed);
    if !names.iter().any(|c| c == schema::TARGET) {
        return Err(format!(
            "training data must contain a '{}' column after preprocessing",
            schema::TARGET
        )
        .into());
    }

    let targets = data::column_f64(&processed, schema::TARGET)?;
    let features = processed.drop(schema::TARGET)?;
    let feature_names = data::column_names(&features);

    let (train_df, test_df, y_train, y_test) = holdout_split(&features, &targets, holdout)?;
    log::info!(
        "Training on {} rows, evaluating on {} held-out rows, {} features",
        train_df.height(),
        test_df.height(),
        feature_names.len()
    );

    // Scaler is fit on training rows only and replayed on the holdout,
    // the same transform-only discipline inference uses.
    let (train_scaled, scaler_state) = fit_scaler(&train_df)?;
    let test_scaled = apply_scaler(&test_df, &scaler_state);

    let x_train = data::feature_matrix(&train_scaled, &feature_names)?;
    let x_test = data::feature_matrix(&test_scaled, &feature_names)?;

    std::fs::create_dir_all(models_dir)?;
    let scaler_path = models_dir.join(registry::SCALER_FILE);
    scaler_state.save(&scaler_path.to_string_lossy())?;
    log::info!("Scaler state saved to '{}'", scaler_path.display());

    log::info!("Training linear regression...");
    let linear = train_linear(&x_train, &y_train)?;
    save_and_evaluate(
        models_dir,
        LINEAR_MODEL_ID,
        Regressor::Linear(linear),
        &feature_names,
        (&x_train, &y_train),
        (&x_test, &y_test),
    )?;

    log::info!("Training gradient boost...");
    let params = BoostParams {
        rounds: boost_rounds,
        learning_rate,
        ..BoostParams::default()
    };
    let boost = train_gradient_boost(&x_train, &y_train, &params)?;
    save_and_evaluate(
        models_dir,
        BOOST_MODEL_ID,
        Regressor::GradientBoost(boost),
        &feature_names,
        (&x_train, &y_train),
        (&x_test, &y_test),
    )?;

    log::info!("Models trained and saved under '{}'", models_dir.display());
    Ok(())
}

fn save_and_evaluate(
    models_dir: &Path,
    model_id: &str,
    regressor: Regressor,
    feature_names: &[String],
    train: (&Array2<f64>, &Array1<f64>),
    test: (&Array2<f64>, &Array1<f64>),
) -> Result<(), Box<dyn std::error::Error>> {
    let bundle = ModelBundle {
        regressor,
        feature_names: Some(feature_names.to_vec()),
    };

    for (split, x, y) in [("Train", train.0, train.1), ("Test", test.0, test.1)] {
        if y.is_empty() {
            continue;
        }
        let predictions = bundle.predict_positional(x)?;
        log::info!(
            "{model_id} {split} RMSE: {:.2}, R2: {:.4}",
            rmse(&predictions, y),
            r_squared(&predictions, y)
        );
    }

    let path = models_dir.join(format!("{model_id}.toml"));
    bundle.save(&path.to_string_lossy())?;
    log::info!("Model '{model_id}' saved to '{}'", path.display());
    Ok(())
}

/// Deterministic stride split: every k-th row is held out, with k chosen to
/// approximate the requested fraction.
fn holdout_split(
    features: &DataFrame,
    targets: &[f64],
    holdout: f64,
) -> Result<(DataFrame, DataFrame, Array1<f64>, Array1<f64>), Box<dyn std::error::Error>> {
    let n = features.height();
    let stride = if holdout > 0.0 && n > 1 {
        ((1.0 / holdout).round() as usize).max(2)
    } else {
        usize::MAX
    };

    let is_test: Vec<bool> = (0..n)
        .map(|i| stride != usize::MAX && i % stride == stride - 1)
        .collect();
    let train_mask: Vec<bool> = is_test.iter().map(|t| !t).collect();

    let train_df = features.filter(&BooleanChunked::from_slice("keep".into(), &train_mask))?;
    let test_df = features.filter(&BooleanChunked::from_slice("keep".into(), &is_test))?;

    let y_train = Array1::from_iter(
        targets
            .iter()
            .zip(is_test.iter())
            .filter(|(_, t)| !**t)
            .map(|(v, _)| *v),
    );
    let y_test = Array1::from_iter(
        targets
            .iter()
            .zip(is_test.iter())
            .filter(|(_, t)| **t)
            .map(|(v, _)| *v),
    );

    Ok((train_df, test_df, y_train, y_test))
}

fn predict_command(
    input_data: &Path,
    models_dir: &Path,
    model_id: &str,
    out: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let registry = ModelRegistry::load_dir(models_dir)?;
    log::info!("Registry serves models: {:?}", registry.model_ids());

    let raw = load_raw_table(input_data)?;
    let report = predict_rows(&registry, raw, model_id)?;

    if report.is_degraded() {
        log::warn!(
            "Predictions returned degraded ({} issues): {}",
            report.degradations.len(),
            report.degradations.join("; ")
        );
    }

    match out {
        Some(path) => {
            let mut writer = BufWriter::new(std::fs::File::create(path)?);
            writeln!(writer, "prediction")?;
            for value in report.predictions.iter() {
                writeln!(writer, "{value}")?;
            }
            writer.flush()?;
            log::info!(
                "{} predictions written to '{}'",
                report.predictions.len(),
                path.display()
            );
        }
        None => {
            for value in report.predictions.iter() {
                println!("{value}");
            }
        }
    }
    Ok(())
}
