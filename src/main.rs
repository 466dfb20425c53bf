use std::error::Error;

fn main() -> Result<(), Box<dyn Error>> {
    chatwire::cli::main()
}
