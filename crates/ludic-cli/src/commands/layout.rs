//! `ludic layout`: Show record layouts.

use ludic_engine::{Bridge, TypeLayoutTable};
use serde_json::json;

use super::TargetArgs;

pub fn execute(target: &TargetArgs, record: Option<&str>, json: bool) -> anyhow::Result<()> {
    let config = target.resolve()?;
    let bridge = Bridge::builder(config).build();
    let layouts = bridge.layouts();

    match record {
        Some(name) => show_record(layouts, name, json),
        None => {
            list_records(layouts, json);
            Ok(())
        }
    }
}

fn list_records(layouts: &TypeLayoutTable, json: bool) {
    let names = layouts.type_names();
    if json {
        let records: Vec<_> = names
            .iter()
            .map(|name| json!({ "name": name, "size": layouts.size_of(name) }))
            .collect();
        println!("{}", serde_json::Value::Array(records));
        return;
    }

    for name in names {
        match layouts.size_of(name) {
            Some(size) => println!("{:<14} {:>4} bytes", name, size),
            None => println!("{:<14}    ? bytes", name),
        }
    }
}

fn show_record(layouts: &TypeLayoutTable, name: &str, json: bool) -> anyhow::Result<()> {
    let fields = layouts.fields(name)?;
    if json {
        let members: Vec<_> = fields
            .iter()
            .map(|(field, d)| {
                json!({ "name": field, "offset": d.offset, "type": d.native_type.c_name() })
            })
            .collect();
        let out = json!({ "name": name, "size": layouts.size_of(name), "fields": members });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    match layouts.size_of(name) {
        Some(size) => println!("{} ({} bytes)", name, size),
        None => println!("{}", name),
    }
    for (field, d) in fields {
        println!("  {:>4}  {:<20} {}", d.offset, field, d.native_type.c_name());
    }
    Ok(())
}
