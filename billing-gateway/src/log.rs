//! Log rotation parameters for this binary, fed into [`billing_log::init`].

use billing_log::StaticLogConfig;

pub struct BillingGatewayLog;

impl StaticLogConfig for BillingGatewayLog {
    const MAX_BYTES_PER_LOG_FILE: u64 = 3_000_000; // 3 MB
    const MAX_LOG_FILES: usize = 10;
    const LOG_FILE_PREFIX: &'static str = "billing-gateway";
}
