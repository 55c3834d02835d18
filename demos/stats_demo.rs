use clap::Parser;
use clap::ValueEnum;
use probe_set::RobinHoodSet;
use probe_set::SwissSet;

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Variant {
    Swiss,
    RobinHood,
    Both,
}

#[derive(Parser, Debug)]
struct Args {
    #[arg(short = 'c', long = "target_capacity", default_value_t = 1000)]
    target_capacity: usize,

    /// Number of keys to add. Defaults to filling the table up to its load
    /// limit without growing.
    #[arg(short = 'n', long = "items")]
    items: Option<usize>,

    #[arg(short = 'v', long = "variant", value_enum, default_value_t = Variant::Both)]
    variant: Variant,
}

fn run_swiss(args: &Args) {
    let mut set: SwissSet<u64> = SwissSet::with_capacity(args.target_capacity);
    println!("== control-byte set ==");
    println!("Initial capacity: {}", set.capacity());

    let items = args.items.unwrap_or(set.capacity() / 8 * 7);
    for key in 0..items as u64 {
        if let Err(err) = set.add(key) {
            println!("add({key}) failed: {err}");
            break;
        }
    }

    println!("Inserted {} keys, capacity {}", set.count(), set.capacity());
    set.probe_stats().print();
}

fn run_robin_hood(args: &Args) {
    let mut set: RobinHoodSet<u64> = RobinHoodSet::with_capacity(args.target_capacity);
    println!("== robin-hood set ==");
    println!("Initial capacity: {}", set.capacity());

    let items = args
        .items
        .unwrap_or(set.capacity() - set.capacity() / 16);
    for key in 0..items as u64 {
        if let Err(err) = set.add(key) {
            println!("add({key}) failed: {err}");
            break;
        }
    }

    println!("Inserted {} keys, capacity {}", set.count(), set.capacity());
    set.probe_stats().print();
}

fn main() {
    let args = Args::parse();

    match args.variant {
        Variant::Swiss => run_swiss(&args),
        Variant::RobinHood => run_robin_hood(&args),
        Variant::Both => {
            run_swiss(&args);
            println!();
            run_robin_hood(&args);
        }
    }
}
