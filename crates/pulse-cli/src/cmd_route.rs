use pulse_core::route::normalize_route;

pub fn execute(path: &str) -> anyhow::Result<()> {
    println!("{}", normalize_route(Some(path)));
    Ok(())
}
