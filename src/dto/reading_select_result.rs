use sqlx::FromRow;

#[derive(Clone, Debug, FromRow)]
pub struct ReadingSelectResult {
    pub id: i64,
    pub timestamp: i64,
    pub address: String,
    pub rssi: i64,
    pub cpu_temp: f64,
    pub battery_volt: f64,
    pub temp: f64,
    pub pressure: f64,
    pub humidity: f64,
}
