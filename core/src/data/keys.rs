/// Keys predefined for persistance:
/// Table of the known peers
pub const PEERS_KEY: &str = "peers";
/// Chain head and derived block indicators
pub const INDICATORS_KEY: &str = "indicators";
/// Fork branches rooted at detected fork points
pub const CORES_KEY: &str = "cores";
