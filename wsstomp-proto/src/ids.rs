use rand::Rng;

/// Generates a random identifier as a hex string
pub fn generate_id() -> String {
    let mut rng = rand::thread_rng();
    let id: [u8; 8] = rng.gen();
    hex::encode(id)
}
