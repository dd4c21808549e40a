use tokio::task::JoinError;

use crate::types::TestResult;

/// Ensures that `name` contains the client type.
pub fn client_test_name(name: String, client_type: String) -> String {
    if name.is_empty() {
        return client_type;
    }
    if name.contains("CLIENT") {
        return name.replace("CLIENT", &client_type);
    }
    format!("{} ({})", name, client_type)
}

/// Converts the outcome of a spawned test body into a result, turning a
/// panic into a failure with the panic message as details.
pub fn extract_test_results(join_result: Result<(), JoinError>) -> TestResult {
    match join_result {
        Ok(()) => TestResult { pass: true, details: "".to_string() },
        Err(err) => {
            let err = err.into_panic();
            let details = if let Some(msg) = err.downcast_ref::<&'static str>() {
                msg.to_string()
            } else if let Some(msg) = err.downcast_ref::<String>() {
                msg.clone()
            } else {
                format!("?{:?}", err)
            };
            TestResult { pass: false, details }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_test_names() {
        assert_eq!(client_test_name("".to_string(), "geth".to_string()), "geth");
        assert_eq!(
            client_test_name("sync with CLIENT".to_string(), "geth".to_string()),
            "sync with geth"
        );
        assert_eq!(client_test_name("sync".to_string(), "geth".to_string()), "sync (geth)");
    }
}
