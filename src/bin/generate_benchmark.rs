//! Writes a synthetic stand-in for the human cortical benchmark: a wide
//! Parquet expression matrix and the matching label CSV.

use std::fs::{self, File};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use arrow::array::{ArrayRef, Float32Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use clap::Parser;
use log::info;
use parquet::arrow::ArrowWriter;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use scsims::ablation::{default_data_dir, LABELS_FILE, PARQUET_MATRIX_FILE};

const SUBCLASSES: [&str; 10] = [
    "L2/3 IT", "L5 IT", "L6 IT", "Lamp5", "Pvalb", "Sncg", "Sst", "Vip", "Astro", "Oligo",
];

#[derive(Parser, Debug)]
#[command(about = "Generate a synthetic benchmark for the ablation driver")]
struct Args {
    #[arg(long, default_value_os_t = default_data_dir().to_path_buf())]
    out_dir: PathBuf,

    #[arg(long, default_value_t = 2000)]
    cells: usize,

    #[arg(long, default_value_t = 200)]
    genes: usize,

    /// Number of subclasses, at most 10
    #[arg(long, default_value_t = 6)]
    classes: usize,

    /// Marker genes per subclass
    #[arg(long, default_value_t = 8)]
    markers: usize,

    #[arg(long, default_value_t = 42)]
    seed: u64,
}

/// Box-Muller normal sample.
fn gauss<R: Rng>(rng: &mut R, mean: f32, std_dev: f32) -> f32 {
    let u1: f32 = rng.gen::<f32>().max(1e-7);
    let u2: f32 = rng.gen();
    let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f32::consts::PI * u2).cos();
    mean + std_dev * z
}

/// Log-normal background with a boost on the subclass's marker genes.
fn expression<R: Rng>(rng: &mut R, gene: usize, class: usize, markers: usize) -> f32 {
    let is_marker = gene / markers == class;
    let mean = if is_marker { 2.0 } else { 0.0 };
    let value = gauss(rng, mean, 0.6).exp() - 1.0;
    if !is_marker && rng.gen_bool(0.6) {
        0.0
    } else {
        value.max(0.0)
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();
    if args.classes == 0 || args.classes > SUBCLASSES.len() {
        bail!("--classes must be between 1 and {}", SUBCLASSES.len());
    }
    if args.classes * args.markers > args.genes {
        bail!(
            "{} classes x {} markers do not fit in {} genes",
            args.classes,
            args.markers,
            args.genes
        );
    }

    let mut rng = StdRng::seed_from_u64(args.seed);
    let cells: Vec<String> = (0..args.cells).map(|i| format!("cell_{i:06}")).collect();
    let classes: Vec<usize> = (0..args.cells).map(|_| rng.gen_range(0..args.classes)).collect();

    // Column-major: one Vec per gene.
    let mut columns = vec![Vec::with_capacity(args.cells); args.genes];
    for &class in &classes {
        for (gene, column) in columns.iter_mut().enumerate() {
            column.push(expression(&mut rng, gene, class, args.markers));
        }
    }

    let mut fields = vec![Field::new("cell", DataType::Utf8, false)];
    fields.extend((0..args.genes).map(|g| Field::new(format!("GENE{g:04}"), DataType::Float32, false)));
    let schema = Arc::new(Schema::new(fields));

    let mut arrays: Vec<ArrayRef> = vec![Arc::new(StringArray::from(cells.clone()))];
    arrays.extend(
        columns
            .into_iter()
            .map(|c| Arc::new(Float32Array::from(c)) as ArrayRef),
    );
    let batch = RecordBatch::try_new(schema.clone(), arrays).context("building record batch")?;

    fs::create_dir_all(&args.out_dir)
        .with_context(|| format!("creating {}", args.out_dir.display()))?;

    let matrix_path = args.out_dir.join(PARQUET_MATRIX_FILE);
    let file = File::create(&matrix_path)
        .with_context(|| format!("creating {}", matrix_path.display()))?;
    let mut writer = ArrowWriter::try_new(file, schema, None)?;
    writer.write(&batch)?;
    writer.close()?;

    let labels_path = args.out_dir.join(LABELS_FILE);
    let mut labels = csv::Writer::from_path(&labels_path)
        .with_context(|| format!("creating {}", labels_path.display()))?;
    labels.write_record(["cell", "subclass_label"])?;
    for (cell, &class) in cells.iter().zip(&classes) {
        labels.write_record([cell.as_str(), SUBCLASSES[class]])?;
    }
    labels.flush()?;

    info!(
        "wrote {} cells x {} genes ({} subclasses) to {}",
        args.cells,
        args.genes,
        args.classes,
        args.out_dir.display()
    );
    info!("train on it with `scsims --matrix-file {PARQUET_MATRIX_FILE}`");
    Ok(())
}
