use std::collections::BTreeMap;

use value::{
    obj,
    ConvexObject,
    ConvexValue,
};

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
pub struct BackendServingRecord {
    // We use string instead of Url so it is easier to implement Arbitrary.
    pub preempt_url: String,
}

impl TryFrom<BackendServingRecord> for ConvexObject {
    type Error = anyhow::Error;

    fn try_from(backend: BackendServingRecord) -> anyhow::Result<Self> {
        obj!(
            "preemptUrl" => backend.preempt_url,
        )
    }
}

impl TryFrom<ConvexObject> for BackendServingRecord {
    type Error = anyhow::Error;

    fn try_from(value: ConvexObject) -> anyhow::Result<Self, Self::Error> {
        let mut fields: BTreeMap<_, _> = value.into();

        let preempt_url = match fields.remove("preemptUrl") {
            Some(ConvexValue::String(s)) => s.into(),
            _ => anyhow::bail!(
                "Missing or invalid `preemptUrl` field for BackendServingRecord: {:?}",
                fields
            ),
        };

        Ok(Self { preempt_url })
    }
}
