use anyhow::Result;
use clap::Args;

use hookline_core::Config;

#[derive(Args)]
pub struct PluginsArgs {
    /// Also list the declared routes
    #[arg(short, long)]
    pub routes: bool,
}

pub async fn run(args: PluginsArgs, config: Config) -> Result<()> {
    let app = crate::demo::build(config).await?;

    print!("{}", app.print_plugins());
    if args.routes {
        println!();
        for (method, path) in app.routes() {
            println!("{:<7} {}", method, path);
        }
    }
    Ok(())
}
