use clap::{Args, Parser, Subcommand};
use pergola::cluster::Linkage;
use pergola::genotype::{encode, RawGenotypes};
use pergola::group::{group_markers, Cut, FilterOptions, GroupAssignment, GroupingOptions};
use pergola::map::{GeneticMap, MappingFunction};
use pergola::order::{order_groups, write_orders_tsv, OrderOptions};
use pergola::pipeline::{self, PergolaConfig};
use pergola::recomb::{estimate_rf, RecombinationOptions, RfMatrix, DEFAULT_CAP};
use pergola::simulate::{shuffle_markers, simulate_population, SimulationParams};
use pergola::PergolaError;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

const INFO: &str = "\
pergola: order genetic markers into linkage groups
usage: pergola [--help] <subcommand>

Subcommands:

  rf:        estimate the recombination frequency matrix.
  group:     split markers into linkage groups.
  order:     group, order, and map markers.
  simulate:  draw a polyploid mapping population.

";

#[derive(Parser)]
#[clap(name = "pergola")]
#[clap(about = INFO)]
struct Cli {
    #[arg(short, long, action = clap::ArgAction::Count)]
    debug: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// Genotype input and encoding.
#[derive(Args)]
struct GenotypeArgs {
    /// a TSV of raw genotypes, one row per marker, `ploidy` columns per sample
    #[arg(required = true)]
    genotypes: String,
    /// the ploidy of the population
    #[arg(long, default_value_t = 2)]
    ploidy: u8,
    /// leading data columns to skip (e.g. parents)
    #[arg(long, default_value_t = 0)]
    ignore: usize,
    /// RF value for unlinked or uninformative pairs, and the upper bound
    #[arg(long, default_value_t = DEFAULT_CAP)]
    cap: f64,
    /// fail if a marker pair shares no observed samples
    #[arg(long, default_value_t = false)]
    strict: bool,
}

impl GenotypeArgs {
    fn recombination(&self) -> RecombinationOptions {
        RecombinationOptions {
            cap: self.cap,
            strict: self.strict,
        }
    }
}

/// Clustering and tree cut.
#[derive(Args)]
struct GroupArgs {
    /// number of linkage groups
    #[arg(long, conflicts_with = "height")]
    groups: Option<usize>,
    /// cut the tree at this merge height instead of a group count
    #[arg(long)]
    height: Option<f64>,
    /// linkage criterion: single, complete, average, or weighted
    #[arg(long, default_value = "average")]
    linkage: Linkage,
    /// dissolve groups with fewer markers than this
    #[arg(long)]
    min_group_size: Option<usize>,
    /// unassign markers whose RF to all other group members exceeds this
    #[arg(long)]
    isolation: Option<f64>,
    /// unassign markers within this RF of an earlier member of their group
    #[arg(long)]
    duplicates: Option<f64>,
}

impl GroupArgs {
    fn grouping(&self) -> Result<GroupingOptions, PergolaError> {
        let cut = match (self.groups, self.height) {
            (Some(k), _) => Cut::Groups(k),
            (None, Some(h)) => Cut::Height(h),
            (None, None) => {
                return Err(PergolaError::InvalidInput(
                    "one of --groups or --height is required".into(),
                ))
            }
        };
        let filtered = self.min_group_size.is_some()
            || self.isolation.is_some()
            || self.duplicates.is_some();
        let filter = if filtered {
            Some(FilterOptions {
                min_group_size: self.min_group_size.unwrap_or(1),
                isolation_threshold: self.isolation,
                duplicate_threshold: self.duplicates,
            })
        } else {
            None
        };
        Ok(GroupingOptions {
            linkage: self.linkage,
            cut,
            filter,
        })
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Estimate the pairwise recombination frequency matrix.
    ///
    /// Writes a square TSV with a header row of marker ids.
    Rf {
        #[command(flatten)]
        input: GenotypeArgs,
        /// the output file path (if not set, uses standard out)
        #[arg(long)]
        output: Option<String>,
    },
    /// Split markers into linkage groups.
    ///
    /// Writes a `marker`, `group` TSV; group 0 holds filtered markers.
    Group {
        #[command(flatten)]
        input: GenotypeArgs,
        #[command(flatten)]
        grouping: GroupArgs,
        /// the output file path (if not set, uses standard out)
        #[arg(long)]
        output: Option<String>,
    },
    /// Group and order markers, then build a genetic map.
    ///
    /// Example:
    ///
    ///  $ pergola order --ploidy 4 --ignore 8 --groups 7 genotypes.tsv.gz \
    ///      --output orders.tsv --map map.tsv --mapping haldane
    Order {
        #[command(flatten)]
        input: GenotypeArgs,
        #[command(flatten)]
        grouping: GroupArgs,
        /// SARF window used to break ties between equally good orders
        #[arg(long, default_value_t = 2)]
        window: usize,
        /// skip the subtree-flipping refinement
        #[arg(long, default_value_t = false)]
        no_refine: bool,
        /// a precomputed group table to use instead of clustering
        #[arg(long)]
        group_table: Option<String>,
        /// mapping function: morgan, haldane, or kosambi
        #[arg(long, default_value = "haldane")]
        mapping: MappingFunction,
        /// the order output file path (if not set, uses standard out)
        #[arg(long)]
        output: Option<String>,
        /// write the genetic map here
        #[arg(long)]
        map: Option<String>,
        /// write the RF matrix here
        #[arg(long)]
        rf: Option<String>,
    },
    /// Simulate raw genotypes of a polyploid population.
    Simulate {
        #[arg(long, default_value_t = 4)]
        ploidy: u8,
        #[arg(long, default_value_t = 7)]
        chromosomes: usize,
        #[arg(long, default_value_t = 20)]
        markers: usize,
        #[arg(long, default_value_t = 200)]
        samples: usize,
        /// distance between neighboring markers, in Morgans
        #[arg(long, default_value_t = 0.02)]
        spacing: f64,
        /// shuffle marker rows after simulating
        #[arg(long, default_value_t = false)]
        shuffle: bool,
        #[arg(long, default_value_t = 1)]
        seed: u64,
        /// the output file path (if not set, uses standard out)
        #[arg(long)]
        output: Option<String>,
    },
}

fn estimate(input: &GenotypeArgs) -> Result<RfMatrix, PergolaError> {
    let raw = RawGenotypes::from_tsv(&input.genotypes)?;
    let geno = encode(&raw, input.ploidy, input.ignore)?;
    estimate_rf(&geno, &input.recombination())
}

#[allow(clippy::too_many_arguments)]
fn order(
    input: &GenotypeArgs,
    grouping: &GroupArgs,
    window: usize,
    refine: bool,
    group_table: Option<&str>,
    mapping: MappingFunction,
    output: Option<&str>,
    map_output: Option<&str>,
    rf_output: Option<&str>,
) -> Result<(), PergolaError> {
    let ordering = OrderOptions {
        linkage: grouping.linkage,
        window,
        refine,
        ..Default::default()
    };

    let (rf, orders, map) = match group_table {
        Some(path) => {
            let rf = estimate(input)?;
            let groups = GroupAssignment::from_tsv(path)?;
            let orders = order_groups(&rf, &groups, &ordering)?;
            let map = GeneticMap::build(&rf, &orders, &mapping)?;
            (rf, orders, map)
        }
        None => {
            let config = PergolaConfig {
                ploidy: input.ploidy,
                ignore_columns: input.ignore,
                recombination: input.recombination(),
                grouping: grouping.grouping()?,
                ordering,
                mapping,
            };
            let raw = RawGenotypes::from_tsv(&input.genotypes)?;
            let result = pipeline::run(&raw, &config)?;
            (result.rf, result.orders, result.map)
        }
    };

    write_orders_tsv(&orders, output)?;
    if let Some(path) = map_output {
        map.write_tsv(Some(path))?;
    }
    if let Some(path) = rf_output {
        rf.write_tsv(Some(path))?;
    }
    Ok(())
}

fn simulate(
    params: &SimulationParams,
    shuffle: bool,
    seed: u64,
    output: Option<&str>,
) -> Result<(), PergolaError> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let population = simulate_population(params, &mut rng)?;
    let raw = if shuffle {
        shuffle_markers(&population.genotypes, &mut rng).0
    } else {
        population.genotypes
    };

    raw.write_tsv(output)
}

fn run() -> Result<(), PergolaError> {
    let cli = Cli::parse();

    let level = match cli.debug {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();

    match &cli.command {
        Some(Commands::Rf { input, output }) => estimate(input)?.write_tsv(output.as_deref()),
        Some(Commands::Group {
            input,
            grouping,
            output,
        }) => {
            let rf = estimate(input)?;
            let groups = group_markers(&rf, &grouping.grouping()?)?;
            groups.write_tsv(output.as_deref())
        }
        Some(Commands::Order {
            input,
            grouping,
            window,
            no_refine,
            group_table,
            mapping,
            output,
            map,
            rf,
        }) => order(
            input,
            grouping,
            *window,
            !*no_refine,
            group_table.as_deref(),
            *mapping,
            output.as_deref(),
            map.as_deref(),
            rf.as_deref(),
        ),
        Some(Commands::Simulate {
            ploidy,
            chromosomes,
            markers,
            samples,
            spacing,
            shuffle,
            seed,
            output,
        }) => {
            let params = SimulationParams {
                ploidy: *ploidy,
                n_chromosomes: *chromosomes,
                markers_per_chromosome: *markers,
                n_samples: *samples,
                marker_spacing: *spacing,
            };
            simulate(&params, *shuffle, *seed, output.as_deref())
        }
        None => {
            println!("{}\n", INFO);
            std::process::exit(1);
        }
    }
}

fn main() {
    match run() {
        Ok(_) => {}
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}
