pub fn is_default<T: Default + PartialEq>(t: &T) -> bool {
	*t == Default::default()
}

pub mod serde_dur {
	use duration_str::HumanFormat;
	pub use duration_str::deserialize_duration as deserialize;
	use serde::Serializer;

	pub fn serialize<S: Serializer, T: HumanFormat>(t: &T, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&t.human_format())
	}
}

pub mod serde_dur_option {
	use duration_str::HumanFormat;
	pub use duration_str::deserialize_option_duration as deserialize;
	use serde::Serializer;

	pub fn serialize<S: Serializer, T: HumanFormat>(
		t: &Option<T>,
		serializer: S,
	) -> Result<S::Ok, S::Error> {
		match t {
			None => serializer.serialize_none(),
			Some(t) => serializer.serialize_str(&t.human_format()),
		}
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	#[derive(Debug, serde::Deserialize, serde::Serialize)]
	struct Wrapper {
		#[serde(with = "super::serde_dur")]
		dur: Duration,
	}

	#[test]
	fn human_durations_round_trip() {
		let w: Wrapper = serde_yaml::from_str("dur: 1500ms").unwrap();
		assert_eq!(w.dur, Duration::from_millis(1500));
		let w: Wrapper = serde_yaml::from_str("dur: 10s").unwrap();
		assert_eq!(w.dur, Duration::from_secs(10));
	}
}
