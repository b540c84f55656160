use serde::Deserialize;
use serde_json::{Map, Value as JsonValue};

use farmflow_forecast::ForecastKind;
use farmflow_infra::pipeline::{ForecastRequest, ProduceError};

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestForecastBody {
    #[serde(rename = "type")]
    pub kind: ForecastKind,
    pub model: Option<String>,
    pub horizon_days: Option<u32>,
    pub input_overrides: Option<Map<String, JsonValue>>,
}

impl RequestForecastBody {
    pub fn into_request(self) -> Result<ForecastRequest, ProduceError> {
        ForecastRequest::validated(self.kind, self.model, self.horizon_days, self.input_overrides)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(body: JsonValue) -> Result<RequestForecastBody, serde_json::Error> {
        serde_json::from_value(body)
    }

    #[test]
    fn camel_case_body() {
        let body = parse(json!({
            "type": "mortality",
            "horizonDays": 10,
            "inputOverrides": { "temperature": 30 },
            "model": null
        }))
        .unwrap();
        let req = body.into_request().unwrap();
        assert_eq!(req.kind, ForecastKind::Mortality);
        assert_eq!(req.horizon_days, 10);
        assert_eq!(req.model, None);
        assert_eq!(req.input_overrides["temperature"], json!(30));
    }

    #[test]
    fn malformed_fields_do_not_deserialize() {
        for body in [
            json!([]),
            json!({}),
            json!({ "type": "weather" }),
            json!({ "type": "growth", "horizonDays": 7.5 }),
            json!({ "type": "growth", "horizonDays": "30" }),
            json!({ "type": "growth", "horizonDays": -1 }),
            json!({ "type": "growth", "inputOverrides": [1] }),
        ] {
            assert!(parse(body.clone()).is_err(), "{body}");
        }
    }

    #[test]
    fn out_of_range_horizon_is_a_validation_error() {
        let body = parse(json!({ "type": "growth", "horizonDays": 400 })).unwrap();
        assert!(matches!(body.into_request(), Err(ProduceError::Validation(_))));
    }
}
