use std::{env, fs, path::PathBuf};

use tilegrid::AggregationMapConfig;

fn usage() {
    eprintln!("Usage: aggregation_sql <mapconfig_json> [layer_index]");
    eprintln!("Example: cargo run --example aggregation_sql -- mapconfig.json 0");
}

fn main() -> anyhow::Result<()> {
    tilegrid::init_tracing();

    let mut args = env::args().skip(1).collect::<Vec<_>>();
    if args.is_empty() {
        usage();
        std::process::exit(1);
    }

    let mapconfig_path = PathBuf::from(args.remove(0));
    let layer_index: usize = if args.is_empty() {
        0
    } else {
        args.remove(0).parse()?
    };

    let raw = fs::read_to_string(mapconfig_path)?;
    let config = AggregationMapConfig::from_value(serde_json::from_str(&raw)?)?;

    if !config.is_aggregation_layer(layer_index) {
        eprintln!("layer {layer_index} is not aggregated");
        std::process::exit(1);
    }

    let sql = config.aggregated_query(layer_index)?;
    println!("{sql}");
    Ok(())
}
