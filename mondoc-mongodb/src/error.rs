//! Mapping of driver errors onto the mapper's error taxonomy.

use mongodb::error::{Error as DriverError, ErrorKind as DriverErrorKind};

use mondoc_core::error::OdmError;

/// Reachability and authentication failures become
/// [`OdmError::Connection`]; everything else becomes
/// [`OdmError::Operation`] carrying the driver's error labels.
pub fn map_driver_error(connection: &str, operation: &str, error: DriverError) -> OdmError {
    match error.kind.as_ref() {
        DriverErrorKind::ServerSelection { .. }
        | DriverErrorKind::Io(_)
        | DriverErrorKind::DnsResolve { .. }
        | DriverErrorKind::Authentication { .. }
        | DriverErrorKind::ConnectionPoolCleared { .. } => OdmError::connection(connection, error.to_string()),
        _ => {
            let mut labels = error
                .labels()
                .iter()
                .cloned()
                .collect::<Vec<_>>();
            labels.sort();

            OdmError::Operation {
                operation: operation.to_string(),
                message: error.to_string(),
                labels,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mondoc_core::error::ErrorKind;

    #[test]
    fn custom_errors_are_operation_errors() {
        let error = DriverError::custom("boom");
        let mapped = map_driver_error("main", "find", error);

        assert_eq!(mapped.kind(), ErrorKind::Operation);
        assert!(mapped.labels().is_empty());
    }
}
