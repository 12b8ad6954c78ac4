//! `ludic info`: Display the resolved build and environment.

use ludic_engine::codegen::{host_isa, pointer_width_of};
use ludic_engine::layout::bootstrap::BOOTSTRAP_VERSION;
use ludic_engine::Bridge;

use super::TargetArgs;

pub fn execute(target: &TargetArgs) -> anyhow::Result<()> {
    let config = target.resolve()?;

    println!("Ludic v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Platform:     {} ({})", std::env::consts::OS, std::env::consts::ARCH);
    match host_isa() {
        Ok(isa) => {
            let width = pointer_width_of(&*isa)?;
            println!("JIT:          available (Cranelift, {}, {}-bit)", isa.triple(), width.bits());
        }
        Err(e) => println!("JIT:          unavailable ({})", e),
    }
    println!("Bootstrap:    v{}", BOOTSTRAP_VERSION);

    let bridge = Bridge::builder(config).build();
    println!();
    println!("Build:");
    print!("{}", indent(&bridge.config().to_toml_string()?));
    println!();
    println!("Records:      {}", bridge.layouts().type_names().len());
    println!("Members:      {}", bridge.layouts().len());
    println!("Services:     {} registered", bridge.functions().len());

    println!();
    println!("Environment:");
    print_env("  LUDIC_LOG", "LUDIC_LOG");

    Ok(())
}

fn indent(text: &str) -> String {
    text.lines().map(|line| format!("  {}\n", line)).collect()
}

fn print_env(label: &str, var: &str) {
    match std::env::var(var) {
        Ok(val) => println!("{} = {}", label, val),
        Err(_) => println!("{} = (default)", label),
    }
}
