use clap::Parser;
use training::util::run_train;
use training::TrainArgs;

fn main() -> anyhow::Result<()> {
    let args = TrainArgs::parse();
    run_train(args)
}
