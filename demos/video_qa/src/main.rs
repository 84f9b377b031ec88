mod driver;

use clap::Parser;

use driver::{run, Args, PllavaRuntime};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let answer = run(&mut PllavaRuntime, &args)?;

    println!("{answer}");

    Ok(())
}
