use rand::Rng;
use rand::seq::SliceRandom;

const ADJECTIVES: &[&str] = &[
    "Admiring", "Adoring", "Agitated", "Amazing", "Angry", "Awesome", "Berserk", "Big", "Boring",
    "Clever", "Cocky", "Compassionate", "Cranky", "Desperate", "Determined", "Distracted",
    "Dreamy", "Ecstatic", "Elated", "Elegant", "Fervent", "Focused", "Furious", "Gigantic",
    "Gloomy", "Goofy", "Grave", "Happy", "Hopeful", "Hungry", "Jolly", "Jovial", "Lonely",
    "Loving", "Modest", "Nostalgic", "Pensive", "Prickly", "Reverent", "Romantic", "Serene",
    "Sharp", "Silly", "Sleepy", "Small", "Stoic", "Suspicious", "Tender", "Thirsty", "Tiny",
    "Trusting",
];

const GATEWAY_NAMES: &[&str] = &[
    "Gateway", "Portal", "Box", "Machine", "Inlet", "Port", "Service", "Computer", "Entry",
];

const SENSOR_NAMES: &[&str] = &[
    "Air Sensor",
    "Weight Sensor",
    "Speed Sensor",
    "GPS",
    "Viscosity Sensor",
    "Accelerometer",
    "Compass",
    "Gyroscope",
    "Luminance Sensor",
    "Vibration Sensor",
    "Temperature Sensor",
    "Humidity Monitor",
    "Wind Speed Monitor",
    "Digital Multimeter",
    "Voltage Sensor",
    "Amperage Sensor",
];

const MANUFACTURERS: &[&str] = &[
    "United Technologies",
    "Toshiba",
    "Sumitomo",
    "Siemens",
    "Schneider Electric",
    "Panasonic",
    "Mitsui",
    "Mitsubishi",
    "Johnson Controls",
    "Honeywell",
    "Hitachi",
    "General Electric",
    "Denso",
    "Bosch",
    "Alstom",
    "ABB",
    "3M",
];

fn pick(values: &'static [&'static str]) -> &'static str {
    let mut rng = rand::thread_rng();
    values
        .choose(&mut rng)
        .copied()
        .unwrap_or("Nameless")
}

pub fn generate_gateway_name() -> String {
    format!("{} {}", pick(ADJECTIVES), pick(GATEWAY_NAMES))
}

pub fn generate_device_name() -> String {
    format!("{} {}", pick(ADJECTIVES), pick(SENSOR_NAMES))
}

pub fn random_manufacturer() -> &'static str {
    pick(MANUFACTURERS)
}

/// Model numbers look like `QHTZ-0427`.
pub fn random_model_number() -> String {
    let mut rng = rand::thread_rng();
    let letters: String = (0..4)
        .map(|_| rng.gen_range(b'A'..=b'Z') as char)
        .collect();
    format!("{letters}-{:04}", rng.gen_range(0..10_000))
}

pub fn random_serial_number() -> String {
    let mut rng = rand::thread_rng();
    format!("{:012}", rng.gen_range(0u64..1_000_000_000_000))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_names_have_two_parts() {
        let name = generate_gateway_name();
        assert!(name.split(' ').count() >= 2);
    }

    #[test]
    fn model_and_serial_numbers_have_fixed_shape() {
        let model = random_model_number();
        assert_eq!(model.len(), 9);
        assert_eq!(model.as_bytes()[4], b'-');

        assert_eq!(random_serial_number().len(), 12);
    }
}
