//! `ludic constants`: Show numeric constants.

use ludic_engine::ConstantTable;

use super::TargetArgs;

pub fn execute(target: &TargetArgs, json: bool) -> anyhow::Result<()> {
    let config = target.resolve()?;
    let table = ConstantTable::for_abi(config.abi);

    if json {
        println!("{}", serde_json::to_string_pretty(&table)?);
        return Ok(());
    }

    println!("# {}", table.abi);
    for constant in &table.entries {
        println!("{:<24} {:#06x}  {}", constant.name, constant.value, constant.value);
    }
    Ok(())
}
