use clap::Args;
use vroot::Session;

#[derive(Args, Debug)]
pub struct ExecArgs {
    /// File that would be executed
    pub file: String,
    /// argv[0] for the new process
    pub argv0: String,
    /// Remaining arguments
    #[arg(num_args = 0..)]
    pub args: Vec<String>,
}

pub fn execute(session: &Session, args: &ExecArgs) -> anyhow::Result<()> {
    let mut argv = vec![args.argv0.clone()];
    argv.extend(args.args.iter().cloned());
    let envp: Vec<String> = std::env::vars().map(|(k, v)| format!("{k}={v}")).collect();

    let prepared = session
        .prepare_exec(&args.file, &argv, &envp)
        .map_err(|err| anyhow::anyhow!("exec would fail: {err} (errno {})", err.errno()))?;

    println!("File\t{}", prepared.virtual_file);
    println!("Mapped\t{}", prepared.file);
    for (i, arg) in prepared.argv.iter().enumerate() {
        println!("argv[{i}]\t{arg}");
    }
    Ok(())
}
