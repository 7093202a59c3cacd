use clap::Parser;
use robin_dict::DictOrder;
use robin_dict::Dictionary;
use robin_dict::HashKey;

#[derive(Parser, Debug)]
struct Args {
    #[arg(short = 'n', long = "entries", default_value_t = 1000)]
    entries: u64,

    /// Print every slot of the final table.
    #[arg(long = "dump", default_value_t = false)]
    dump: bool,
}

fn main() {
    let args = Args::parse();

    println!("Filling dictionary with {} entries...", args.entries);

    let mut dict: Dictionary<u64> = Dictionary::new(DictOrder::Unordered);
    for i in 0..args.entries {
        dict.insert_key(HashKey::from(i), i, None);
    }

    println!("Entries: {}", dict.len());
    println!("Capacity: {}", dict.capacity());
    println!(
        "Load factor: {:.2}%",
        (dict.len() as f64 / dict.capacity() as f64) * 100.0
    );
    println!("Cumulative inserts: {}", dict.num_cumulative_inserts());

    dict.distance_stats().print();

    if args.dump {
        dict.dump();
    }
}
