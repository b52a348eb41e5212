use rand::Rng;

pub const SECRET_PREFIX: &str = "RALPH_COMPLETE_";

/// Generate the per-run completion token: prefix plus 8 lowercase hex chars.
pub fn generate_secret() -> String {
    let nonce: u32 = rand::thread_rng().gen();
    format!("{SECRET_PREFIX}{nonce:08x}")
}

/// True iff the secret appears as a contiguous substring of the output.
pub fn detect_secret(output: &str, secret: &str) -> bool {
    output.contains(secret)
}
