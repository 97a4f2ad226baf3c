// json.rs - JSON structured log backend
/// Emit a latency record in JSON format to stderr for machine parsing
#[inline]
pub fn emit(name: &str, ms: f64) {
    eprintln!(
        "{{\"ts\":{},\"name\":\"{}\",\"ms\":{:.3}}}",
        crate::now_ns(),
        name,
        ms
    );
}
