use clap::Parser;
use ruamq::{CANONICAL_FORMAT_VERSION, Signature, VOID};

#[derive(Parser, Debug, Clone)]
#[command(version, about = "Prints the queue identity of a method signature", long_about = None)]
pub struct Args {
    /// Fully-qualified method name, e.g. `Calculator.add`.
    pub name: String,

    /// Return type.
    #[arg(short, long, default_value = VOID)]
    pub return_type: String,

    /// Parameter type, repeated in declaration order.
    #[arg(short, long = "arg")]
    pub args: Vec<String>,

    /// Print JSON.
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

fn main() {
    let args = Args::parse();

    let signature = Signature::new(args.return_type, args.name, args.args);
    let identity = signature.identity();
    if args.json {
        let info = serde_json::json!({
            "version": CANONICAL_FORMAT_VERSION,
            "signature": signature,
            "canonical": signature.canonical(),
            "identity": identity,
        });
        match serde_json::to_string_pretty(&info) {
            Ok(text) => println!("{text}"),
            Err(err) => eprintln!("encoding failed: {err}"),
        }
    } else {
        println!("{}", signature.canonical());
        println!("{identity}");
    }
}
