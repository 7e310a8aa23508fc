use std::{fs, io};

use finetune::FinetuneConfig;

fn main() -> io::Result<()> {
    env_logger::init();

    let cfg = FinetuneConfig::from_cli()?;
    fs::create_dir_all(&cfg.output_dir)?;

    finetune::run(&cfg)?;
    Ok(())
}
