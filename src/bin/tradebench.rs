use anyhow::Result;

fn main() -> Result<()> {
    tradebench::cli::run()
}
