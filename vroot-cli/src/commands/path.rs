use clap::Args;
use vroot::Session;
use vroot::mapping::fnclass;

#[derive(Args, Debug)]
pub struct PathArgs {
    /// Pathnames to map
    #[arg(required = true, num_args = 1..)]
    pub paths: Vec<String>,
}

pub fn execute(
    session: &Session,
    binary_name: &str,
    function: &str,
    args: &PathArgs,
) -> anyhow::Result<()> {
    for path in &args.paths {
        let res = session.map_path(binary_name, function, fnclass::ANY, path, false);
        if let Some(errno) = res.errno {
            println!("{path} => <error: {errno}>");
            continue;
        }
        let mapped = res.path().unwrap_or(path);
        let readonly = if res.readonly { " (readonly)" } else { "" };
        println!("{path} => {mapped}{readonly}");
    }
    Ok(())
}
