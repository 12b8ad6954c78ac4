//! `ludic services`: Show runtime services.

use ludic_engine::symbols::catalogue::{AbiTy, Provider, ServiceEntry, SigSpec, SERVICE_CATALOGUE};

use super::TargetArgs;

pub fn execute(target: &TargetArgs, all: bool, json: bool) -> anyhow::Result<()> {
    let config = target.resolve()?;
    let entries: Vec<&ServiceEntry> = SERVICE_CATALOGUE
        .iter()
        .filter(|e| e.scope.includes(config.abi))
        .filter(|e| all || e.provider == Provider::Host)
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    for entry in entries {
        let marker = match entry.provider {
            Provider::Host => ' ',
            Provider::Bridge => '*',
        };
        match &entry.sig {
            Some(sig) => println!("{} {:<22} {}", marker, entry.name, render(sig)),
            None => println!("{} {:<22} (runtime state)", marker, entry.name),
        }
    }
    if all {
        println!();
        println!("* provided by the bridge");
    }
    Ok(())
}

fn ty_name(ty: AbiTy) -> &'static str {
    match ty {
        AbiTy::Value => "VALUE",
        AbiTy::Id => "ID",
        AbiTy::Long => "long",
        AbiTy::Ptr => "void *",
        AbiTy::Int => "int",
        AbiTy::I64 => "int64_t",
    }
}

fn render(sig: &SigSpec) -> String {
    let mut params: Vec<&str> = sig.params.iter().map(|&t| ty_name(t)).collect();
    if sig.variadic {
        params.push("...");
    }
    let ret = sig.ret.map_or("void", ty_name);
    format!("({}) -> {}", params.join(", "), ret)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ludic_engine::symbols::catalogue::find;

    #[test]
    fn test_render() {
        let sig = find("frame_protect").unwrap().sig.unwrap();
        assert_eq!(render(&sig), "(int64_t, void *, void *, void *) -> int64_t");
        let sig = find("frame_current").unwrap().sig.unwrap();
        assert_eq!(render(&sig), "() -> void *");
    }
}
