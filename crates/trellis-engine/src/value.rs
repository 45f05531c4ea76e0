//! Value model: what is wanted and what was produced.
//!
//! - [`ValueRequirement`]: an abstract request for a named value on a target
//! - [`ValueSpecification`]: the concrete output a function promises to produce
//! - [`ComputedValue`]: a specification paired with its runtime value
//!
//! All types are immutable, value-equal and hashable, so they serve as map keys
//! throughout resolution, scheduling and caching.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use trellis_traits::ids::{FunctionId, TargetId};
use trellis_traits::value::DataValue;

/// Well-known property names.
pub mod property_names {
    /// Identifies the function that produced a value. Set on every resolved specification.
    pub const FUNCTION: &str = "Function";
    /// Tells apart applications of one function to different inputs.
    pub const VARIANT: &str = "Variant";
    /// Currency of a monetary value.
    pub const CURRENCY: &str = "Currency";
    /// Named calculation configuration.
    pub const CALCULATION_CONFIGURATION: &str = "CalculationConfiguration";
    /// Calculation method (e.g. "Analytic", "MonteCarlo").
    pub const CALCULATION_METHOD: &str = "CalculationMethod";
    /// Curve name.
    pub const CURVE: &str = "Curve";
}

// =============================================================================
// COMPUTATION TARGETS
// =============================================================================

/// Type tag of a computation target, used for function applicability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ComputationTargetType {
    /// A bare identifier (currency, curve name, index).
    Primitive,
    /// A security / instrument.
    Security,
    /// A position in a security.
    Position,
    /// A single trade.
    Trade,
    /// A node of a portfolio tree (aggregate).
    PortfolioNode,
}

impl fmt::Display for ComputationTargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primitive => write!(f, "PRIMITIVE"),
            Self::Security => write!(f, "SECURITY"),
            Self::Position => write!(f, "POSITION"),
            Self::Trade => write!(f, "TRADE"),
            Self::PortfolioNode => write!(f, "PORTFOLIO_NODE"),
        }
    }
}

/// Identity of a computation target: its type tag and identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComputationTargetSpecification {
    /// Target type.
    pub target_type: ComputationTargetType,
    /// Target identifier.
    pub id: TargetId,
}

impl ComputationTargetSpecification {
    /// Creates a target specification.
    pub fn new(target_type: ComputationTargetType, id: impl Into<TargetId>) -> Self {
        Self {
            target_type,
            id: id.into(),
        }
    }

    /// Creates a primitive target specification.
    pub fn primitive(id: impl Into<TargetId>) -> Self {
        Self::new(ComputationTargetType::Primitive, id)
    }

    /// Creates a security target specification.
    pub fn security(id: impl Into<TargetId>) -> Self {
        Self::new(ComputationTargetType::Security, id)
    }

    /// Creates a position target specification.
    pub fn position(id: impl Into<TargetId>) -> Self {
        Self::new(ComputationTargetType::Position, id)
    }

    /// Creates a trade target specification.
    pub fn trade(id: impl Into<TargetId>) -> Self {
        Self::new(ComputationTargetType::Trade, id)
    }

    /// Creates a portfolio node target specification.
    pub fn portfolio_node(id: impl Into<TargetId>) -> Self {
        Self::new(ComputationTargetType::PortfolioNode, id)
    }
}

impl fmt::Display for ComputationTargetSpecification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}~{}", self.target_type, self.id)
    }
}

/// The entity a calculation runs against.
///
/// Opaque to the engine beyond identity and type; functions may read attributes
/// when declaring their requirements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputationTarget {
    /// Target identity.
    pub specification: ComputationTargetSpecification,
    /// Descriptive attributes (currency, underlying, ...).
    pub attributes: BTreeMap<String, String>,
}

impl ComputationTarget {
    /// Creates a target with no attributes.
    pub fn new(specification: ComputationTargetSpecification) -> Self {
        Self {
            specification,
            attributes: BTreeMap::new(),
        }
    }

    /// Adds an attribute.
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Returns the target type.
    pub fn target_type(&self) -> ComputationTargetType {
        self.specification.target_type
    }

    /// Returns the target identifier.
    pub fn id(&self) -> &TargetId {
        &self.specification.id
    }

    /// Returns an attribute value.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }
}

impl From<ComputationTargetSpecification> for ComputationTarget {
    fn from(specification: ComputationTargetSpecification) -> Self {
        Self::new(specification)
    }
}

// =============================================================================
// VALUE PROPERTIES
// =============================================================================

/// Constraint on a single property.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PropertyConstraint {
    /// Allowed values; `None` is a wildcard.
    values: Option<BTreeSet<String>>,
    /// Whether absence of the property on the producing side is acceptable.
    optional: bool,
}

impl PropertyConstraint {
    fn any() -> Self {
        Self {
            values: None,
            optional: false,
        }
    }

    fn of<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            values: Some(values.into_iter().map(Into::into).collect()),
            optional: false,
        }
    }

    /// Allowed values, or `None` for a wildcard.
    pub fn values(&self) -> Option<&BTreeSet<String>> {
        self.values.as_ref()
    }

    /// Whether this constraint is a wildcard.
    pub fn is_wildcard(&self) -> bool {
        self.values.is_none()
    }

    /// Whether the property may be absent.
    pub fn is_optional(&self) -> bool {
        self.optional
    }

    fn accepts(&self, produced: &PropertyConstraint) -> bool {
        match (&self.values, &produced.values) {
            (None, _) | (_, None) => true,
            (Some(wanted), Some(offered)) => !wanted.is_disjoint(offered),
        }
    }
}

/// A set of named properties, each a finite value set or a wildcard.
///
/// On a requirement the properties are *constraints*; on a specification they
/// describe what is produced. A specification may be more specific than the
/// requirement it satisfies.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ValueProperties {
    properties: BTreeMap<String, PropertyConstraint>,
}

impl ValueProperties {
    /// Empty property set (no constraints).
    pub fn none() -> Self {
        Self::default()
    }

    /// Starts a builder.
    pub fn builder() -> ValuePropertiesBuilder {
        ValuePropertiesBuilder::default()
    }

    /// Starts a builder seeded with these properties.
    pub fn to_builder(&self) -> ValuePropertiesBuilder {
        ValuePropertiesBuilder {
            properties: self.properties.clone(),
        }
    }

    /// Returns true if there are no properties.
    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    /// Property names in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.properties.keys().map(String::as_str)
    }

    /// Constraint for a property.
    pub fn get(&self, name: &str) -> Option<&PropertyConstraint> {
        self.properties.get(name)
    }

    /// Values of a property; `None` if absent or a wildcard.
    pub fn values(&self, name: &str) -> Option<&BTreeSet<String>> {
        self.properties.get(name).and_then(|c| c.values())
    }

    /// The single value of a property, if it has exactly one.
    pub fn single_value(&self, name: &str) -> Option<&str> {
        self.values(name).and_then(|values| {
            if values.len() == 1 {
                values.iter().next().map(String::as_str)
            } else {
                None
            }
        })
    }

    /// Returns true if the produced properties satisfy these constraints.
    pub fn is_satisfied_by(&self, produced: &ValueProperties) -> bool {
        self.properties.iter().all(|(name, constraint)| {
            match produced.properties.get(name) {
                None => constraint.optional,
                Some(offered) => constraint.accepts(offered),
            }
        })
    }

    /// Narrows these (produced) properties by a requirement's constraints.
    ///
    /// Wildcards are replaced by the requirement's values and finite sets are
    /// intersected. Properties the requirement does not mention are kept.
    pub fn compose(&self, constraints: &ValueProperties) -> ValueProperties {
        let mut properties = self.properties.clone();
        for (name, wanted) in &constraints.properties {
            if let Some(offered) = properties.get_mut(name) {
                match (&offered.values, &wanted.values) {
                    (None, Some(values)) => offered.values = Some(values.clone()),
                    (Some(have), Some(values)) => {
                        let narrowed: BTreeSet<String> =
                            have.intersection(values).cloned().collect();
                        if !narrowed.is_empty() {
                            offered.values = Some(narrowed);
                        }
                    }
                    (_, None) => {}
                }
                offered.optional = false;
            }
        }
        ValueProperties { properties }
    }
}

impl fmt::Display for ValueProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (name, constraint)) in self.properties.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", name)?;
            if constraint.optional {
                write!(f, "?")?;
            }
            match &constraint.values {
                None => write!(f, "=*")?,
                Some(values) => {
                    let joined: Vec<&str> = values.iter().map(String::as_str).collect();
                    write!(f, "=[{}]", joined.join(","))?;
                }
            }
        }
        write!(f, "}}")
    }
}

/// Builder for [`ValueProperties`].
#[derive(Debug, Clone, Default)]
pub struct ValuePropertiesBuilder {
    properties: BTreeMap<String, PropertyConstraint>,
}

impl ValuePropertiesBuilder {
    /// Sets a property to a single value.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties
            .insert(name.into(), PropertyConstraint::of([value.into()]));
        self
    }

    /// Sets a property to a set of values.
    pub fn with_values<I, S>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.properties
            .insert(name.into(), PropertyConstraint::of(values));
        self
    }

    /// Sets a property to a wildcard.
    pub fn with_any(mut self, name: impl Into<String>) -> Self {
        self.properties.insert(name.into(), PropertyConstraint::any());
        self
    }

    /// Marks a property optional, adding it as a wildcard if absent.
    pub fn with_optional(mut self, name: impl Into<String>) -> Self {
        self.properties
            .entry(name.into())
            .or_insert_with(PropertyConstraint::any)
            .optional = true;
        self
    }

    /// Removes a property.
    pub fn without(mut self, name: &str) -> Self {
        self.properties.remove(name);
        self
    }

    /// Builds the property set.
    pub fn build(self) -> ValueProperties {
        ValueProperties {
            properties: self.properties,
        }
    }
}

// =============================================================================
// REQUIREMENTS AND SPECIFICATIONS
// =============================================================================

/// A request for a named value on a target, with property constraints.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValueRequirement {
    /// Value name (e.g. "PresentValue", "Delta").
    pub value_name: String,
    /// Target the value is wanted for.
    pub target: ComputationTargetSpecification,
    /// Property constraints.
    pub constraints: ValueProperties,
}

impl ValueRequirement {
    /// Creates an unconstrained requirement.
    pub fn new(value_name: impl Into<String>, target: ComputationTargetSpecification) -> Self {
        Self {
            value_name: value_name.into(),
            target,
            constraints: ValueProperties::none(),
        }
    }

    /// Sets the constraints.
    pub fn with_constraints(mut self, constraints: ValueProperties) -> Self {
        self.constraints = constraints;
        self
    }

    /// Adds a single-valued constraint.
    pub fn with_constraint(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.constraints = self.constraints.to_builder().with(name, value).build();
        self
    }
}

impl fmt::Display for ValueRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.value_name, self.target)?;
        if !self.constraints.is_empty() {
            write!(f, "{}", self.constraints)?;
        }
        Ok(())
    }
}

/// The concrete descriptor of a value a function produces.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValueSpecification {
    /// Value name.
    pub value_name: String,
    /// Target the value is produced for.
    pub target: ComputationTargetSpecification,
    /// Resolved properties.
    pub properties: ValueProperties,
}

impl ValueSpecification {
    /// Creates a specification.
    pub fn new(
        value_name: impl Into<String>,
        target: ComputationTargetSpecification,
        properties: ValueProperties,
    ) -> Self {
        Self {
            value_name: value_name.into(),
            target,
            properties,
        }
    }

    /// Returns true if this specification satisfies the requirement.
    pub fn satisfies(&self, requirement: &ValueRequirement) -> bool {
        self.value_name == requirement.value_name
            && self.target == requirement.target
            && requirement.constraints.is_satisfied_by(&self.properties)
    }

    /// The producing function, if recorded.
    pub fn function_id(&self) -> Option<FunctionId> {
        self.properties
            .single_value(property_names::FUNCTION)
            .map(FunctionId::from)
    }

    /// Narrows this specification by a requirement and stamps the producing function.
    pub fn resolve_for(&self, requirement: &ValueRequirement, function: &FunctionId) -> Self {
        let properties = self
            .properties
            .compose(&requirement.constraints)
            .to_builder()
            .with(property_names::FUNCTION, function.as_str())
            .build();
        Self {
            value_name: self.value_name.clone(),
            target: self.target.clone(),
            properties,
        }
    }

    /// A requirement this specification satisfies exactly.
    pub fn to_requirement(&self) -> ValueRequirement {
        ValueRequirement {
            value_name: self.value_name.clone(),
            target: self.target.clone(),
            constraints: self.properties.clone(),
        }
    }
}

impl fmt::Display for ValueSpecification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]{}", self.value_name, self.target, self.properties)
    }
}

/// A specification paired with the value produced for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputedValue {
    /// What was produced.
    pub specification: ValueSpecification,
    /// The runtime value.
    pub value: DataValue,
}

impl ComputedValue {
    /// Creates a computed value.
    pub fn new(specification: ValueSpecification, value: impl Into<DataValue>) -> Self {
        Self {
            specification,
            value: value.into(),
        }
    }
}
