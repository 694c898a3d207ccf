use crate::storage::schema::{machines, reports};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use diesel::prelude::*;
use serde::Serialize;

#[derive(Debug, Clone, Serialize, Queryable, Identifiable, Selectable)]
#[diesel(table_name = machines)]
pub struct Machine {
    pub id: i32,
    pub name: String,
}

#[derive(Insertable)]
#[diesel(table_name = machines)]
pub struct NewMachine<'a> {
    pub name: &'a str,
}

#[derive(Debug, Clone, Serialize, Queryable, Identifiable, Selectable)]
#[diesel(table_name = reports)]
pub struct Report {
    pub id: i32,
    pub machine_name: String,
    pub report_date: NaiveDate,
    pub report_time: NaiveTime,
    pub description: String,
    pub image: Option<String>,
    pub created_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = reports)]
pub struct NewReport<'a> {
    pub machine_name: &'a str,
    pub report_date: NaiveDate,
    pub report_time: NaiveTime,
    pub description: &'a str,
    pub image: Option<&'a str>,
}
